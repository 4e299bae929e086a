//! On-disk snapshot directories.
//!
//! A stored snapshot is a directory of per-shard item streams plus a JSON
//! manifest written last as the completion marker:
//!
//! ```text
//! <dir>/data/shard-<i>      length-prefixed item streams
//! <dir>/data/files.json     JSON array of shard file names
//! ```

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, ErrorKind, Write};
use std::path::Path;
use std::sync::atomic::Ordering as AtomicOrdering;
use std::sync::Arc;
use std::thread;

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::config::FileFormat;
use crate::error::{Error, Result};
use crate::item::Item;
use crate::snapshot::Snapshot;
use crate::Store;

const ENCODE_BUF_SIZE: usize = 4;
const MANIFEST: &str = "files.json";

/// Writes one shard's item stream in the raw format.
struct RawItemWriter {
    out: BufWriter<File>,
    scratch: [u8; ENCODE_BUF_SIZE],
}

impl RawItemWriter {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            out: BufWriter::new(File::create(path)?),
            scratch: [0u8; ENCODE_BUF_SIZE],
        })
    }

    fn write_item(&mut self, item: &Item) -> Result<()> {
        item.encode(&mut self.scratch, &mut self.out)
    }

    fn close(mut self) -> Result<()> {
        self.out.flush()?;
        Ok(())
    }
}

/// Reads one shard's item stream in the raw format.
struct RawItemReader {
    input: BufReader<File>,
    scratch: [u8; ENCODE_BUF_SIZE],
}

impl RawItemReader {
    fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            input: BufReader::new(File::open(path)?),
            scratch: [0u8; ENCODE_BUF_SIZE],
        })
    }

    /// Returns `None` at a clean end of stream.
    fn read_item(&mut self) -> Result<Option<Item>> {
        match Item::decode(&mut self.scratch, &mut self.input) {
            Ok(item) => Ok(Some(item)),
            Err(Error::Io { source }) if source.kind() == ErrorKind::UnexpectedEof => Ok(None),
            Err(err) => Err(err),
        }
    }
}

fn require_raw_format(format: FileFormat) -> Result<()> {
    match format {
        FileFormat::Raw => Ok(()),
        FileFormat::Forestdb => Err(Error::invalid_file_format(
            "forestdb shards require the forestdb backend",
        )),
    }
}

impl Store {
    /// Writes every item visible to `snap` into `<dir>/data`, sharded over
    /// one file per available core and scanned with `concurrency` workers.
    /// The manifest is written only after all shards completed, so a
    /// partial directory is never mistaken for a stored snapshot.
    pub fn store_to_disk(
        &self,
        dir: &Path,
        snap: &Arc<Snapshot>,
        concurrency: usize,
        item_callback: Option<&(dyn Fn(&Item) + Send + Sync)>,
    ) -> Result<()> {
        require_raw_format(self.core.config.file_format)?;

        let datadir = dir.join("data");
        fs::create_dir_all(&datadir)?;
        let shards = thread::available_parallelism().map_or(1, usize::from);

        let mut files = Vec::with_capacity(shards);
        let mut writers = Vec::with_capacity(shards);
        for shard in 0..shards {
            let file = format!("shard-{shard}");
            writers.push(Mutex::new(RawItemWriter::open(&datadir.join(&file))?));
            files.push(file);
        }

        self.visit(snap, shards, concurrency, |item, shard| {
            writers[shard].lock().write_item(item)?;
            if let Some(callback) = item_callback {
                callback(item);
            }
            Ok(())
        })?;

        for writer in writers {
            writer.into_inner().close()?;
        }

        let manifest = File::create(datadir.join(MANIFEST))?;
        serde_json::to_writer(manifest, &files)?;
        info!(dir = %dir.display(), sn = snap.sn(), shards, "snapshot stored to disk");
        Ok(())
    }

    /// Loads a snapshot directory written by [`Store::store_to_disk`] into
    /// this (empty) store with `concurrency` parallel shard readers, then
    /// takes and returns the covering snapshot.
    pub fn load_from_disk(
        &self,
        dir: &Path,
        concurrency: usize,
        item_callback: Option<&(dyn Fn(&Item) + Send + Sync)>,
    ) -> Result<Arc<Snapshot>> {
        require_raw_format(self.core.config.file_format)?;

        let datadir = dir.join("data");
        let manifest = File::open(datadir.join(MANIFEST))?;
        let files: Vec<String> = serde_json::from_reader(manifest)?;

        let (tx, rx) = crossbeam_channel::unbounded::<usize>();
        for shard in 0..files.len() {
            let _ = tx.send(shard);
        }
        drop(tx);

        let workers = concurrency.clamp(1, files.len().max(1));
        let failures: Vec<Mutex<Option<Error>>> =
            (0..files.len()).map(|_| Mutex::new(None)).collect();

        thread::scope(|s| {
            for _ in 0..workers {
                let rx = rx.clone();
                let datadir = &datadir;
                let files = &files;
                let failures = &failures;
                s.spawn(move || {
                    let mut writer = self.new_writer();
                    while let Ok(shard) = rx.recv() {
                        if let Err(err) = (|| -> Result<()> {
                            let mut reader = RawItemReader::open(&datadir.join(&files[shard]))?;
                            let mut loaded = 0u64;
                            while let Some(item) = reader.read_item()? {
                                if self.core.closed.load(AtomicOrdering::Acquire) {
                                    return Err(Error::Shutdown);
                                }
                                if let Some(callback) = item_callback {
                                    callback(&item);
                                }
                                writer.put_item(item);
                                loaded += 1;
                            }
                            debug!(shard, loaded, "loaded shard");
                            Ok(())
                        })() {
                            *failures[shard].lock() = Some(err);
                            return;
                        }
                    }
                });
            }
        });

        for failure in failures {
            if let Some(err) = failure.into_inner() {
                return Err(err);
            }
        }

        let snap = self.new_snapshot();
        info!(dir = %dir.display(), items = snap.count(), "snapshot loaded from disk");
        Ok(snap)
    }
}

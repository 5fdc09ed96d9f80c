//! Snapshot container: durable point-in-time images of every context
//!
//! The container is a ZIP archive where entry `i.json` holds the JSON-encoded
//! state of the i-th context. Files are written to `<path>.tmp` and renamed
//! over the destination only after a successful write, so a crash mid-save
//! leaves the previous snapshot intact.

use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufReader, Read, Seek, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::Result;
use crate::mux::QueueStateMux;
use crate::state::EncodedQueueState;

/// One archive entry: a context name plus its encoded queue state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContextState {
    pub name: String,
    pub encoded: EncodedQueueState,
}

/// Writes the snapshot archive for the given context states.
pub fn write_archive<W: Write + Seek>(states: &[ContextState], w: W) -> Result<()> {
    let mut zip = ZipWriter::new(w);
    let options = FileOptions::default().compression_method(CompressionMethod::Deflated);
    for (i, state) in states.iter().enumerate() {
        zip.start_file(format!("{i}.json"), options)?;
        serde_json::to_writer(&mut zip, state)?;
    }
    zip.finish()?;
    Ok(())
}

/// Reads back an archive written by [`write_archive`].
pub fn read_archive<R: Read + Seek>(r: R) -> Result<Vec<ContextState>> {
    let mut archive = ZipArchive::new(r)?;
    let mut states = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let file = archive.by_index(i)?;
        states.push(serde_json::from_reader(file)?);
    }
    Ok(states)
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os: OsString = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

/// Serializes the multiplexer to `path` with atomic-replace semantics.
///
/// With `shutdown` set the multiplexer stops accepting operations before the
/// state is encoded, so the written image is final.
pub fn save_to_path(mux: &QueueStateMux, path: &Path, shutdown: bool) -> Result<()> {
    let tmp = tmp_path(path);
    let file = File::create(&tmp)?;
    mux.serialize(&file, shutdown)?;
    file.sync_all()?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Rebuilds a multiplexer from a snapshot file written by [`save_to_path`].
pub fn load_from_path(path: &Path, timeout: Duration) -> Result<QueueStateMux> {
    let file = BufReader::new(File::open(path)?);
    QueueStateMux::deserialize(file, timeout)
}

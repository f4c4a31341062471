//! Snapshots of server data directories.
//!
//! A snapshot is taken once, right after a server's data directory is first initialized, and
//! copied back over the data directory on every reset. Restoring a snapshot is much cheaper
//! than re-initializing a server.

use std::{fs, io, path::Path};

use fleet_utils::{error::ResultLocation, here};

use crate::{error::ServerError, layout::ServerLayout};

/// Replaces any existing snapshot with a copy of the current data directory.
pub async fn capture(layout: &ServerLayout) -> Result<(), ServerError> {
    let datadir = layout.datadir.clone();
    let snapshot = layout.snapshot.clone();

    tokio::task::spawn_blocking(move || {
        if snapshot.exists() {
            fs::remove_dir_all(&snapshot)?;
        }
        copy_dir_all(&datadir, &snapshot)
    })
    .await
    .located(here!())?
    .located(here!())?;

    tracing::debug!(snapshot=?layout.snapshot, "captured snapshot");
    Ok(())
}

/// Replaces the contents of the data directory with the snapshot.
pub async fn restore(layout: &ServerLayout) -> Result<(), ServerError> {
    if !layout.snapshot.is_dir() {
        return Err(ServerError::SnapshotMissing(layout.snapshot.clone()));
    }

    let datadir = layout.datadir.clone();
    let snapshot = layout.snapshot.clone();

    tokio::task::spawn_blocking(move || {
        clear_dir(&datadir)?;
        copy_dir_all(&snapshot, &datadir)
    })
    .await
    .located(here!())?
    .located(here!())?;

    tracing::debug!(datadir=?layout.datadir, "restored snapshot");
    Ok(())
}

/// Deletes the snapshot, if any.
pub async fn discard(layout: &ServerLayout) -> Result<(), ServerError> {
    let snapshot = layout.snapshot.clone();
    tokio::task::spawn_blocking(move || match fs::remove_dir_all(&snapshot) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        res => res,
    })
    .await
    .located(here!())?
    .located(here!())?;
    Ok(())
}

pub fn exists(layout: &ServerLayout) -> bool {
    layout.snapshot.is_dir()
}

/// Recursively copies `src` into `dst`, creating `dst` if needed.
pub fn copy_dir_all(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let target = dst.join(entry.file_name());
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            copy_dir_all(&entry.path(), &target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            std::os::unix::fs::symlink(link, target)?;
        } else {
            fs::copy(entry.path(), target)?;
        }
    }
    Ok(())
}

/// Removes everything inside `dir`, leaving `dir` itself in place.
pub fn clear_dir(dir: &Path) -> io::Result<()> {
    if !dir.exists() {
        return fs::create_dir_all(dir);
    }
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

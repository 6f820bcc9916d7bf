//! Load/save primitives for pipelines, vistrails and logs.
//!
//! Everything persistent in the crate is serde-serializable; this module fixes
//! the on-disk and on-the-wire form (JSON) and maps failures to
//! [`WorkflowError::Persistence`].

use crate::errors::WorkflowError;
use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::fs::{File, rename};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Serialize `obj` to its text form.
///
/// # Errors
///
/// Returns a persistence error if `obj` cannot be encoded.
pub fn serialize<T: Serialize>(obj: &T) -> Result<String> {
    serde_json::to_string(obj).map_err(|e| WorkflowError::Persistence(format!("serialize: {e}")).into())
}

/// Rebuild a `T` from text produced by [`serialize`].
///
/// # Errors
///
/// Returns a persistence error if `text` is not a valid `T`.
pub fn unserialize<T: DeserializeOwned>(text: &str) -> Result<T> {
    serde_json::from_str(text).map_err(|e| {
        WorkflowError::Persistence(format!("unserialize {}: {e}", std::any::type_name::<T>())).into()
    })
}

/// A file holding one persisted document.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileLocator {
    path: PathBuf,
}

impl FileLocator {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not hold a `T`.
    pub fn load<T: DeserializeOwned>(&self) -> Result<T> {
        let file = File::open(&self.path).with_context(|| format!("opening {}", self.path.display()))?;
        serde_json::from_reader(BufReader::new(file)).map_err(|e| {
            WorkflowError::Persistence(format!("loading {}: {e}", self.path.display())).into()
        })
    }

    /// Write `obj`, replacing the file atomically via a sibling temp file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<T: Serialize>(&self, obj: &T) -> Result<()> {
        let tmp = self.path.with_extension("tmp");
        {
            let file = File::create(&tmp).with_context(|| format!("creating {}", tmp.display()))?;
            let mut w = BufWriter::new(file);
            serde_json::to_writer(&mut w, obj)
                .map_err(|e| WorkflowError::Persistence(format!("saving {}: {e}", self.path.display())))?;
            w.flush().context("flushing document")?;
            w.get_ref().sync_all().context("syncing document to disk")?;
        }
        rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        Ok(())
    }
}

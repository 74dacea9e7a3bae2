use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::{ForgeError, ForgeResult};

/// Compute the SHA256 digest of the file at `path` and return it as a hex string.
pub fn compute_sha256(path: &Path) -> ForgeResult<String> {
    let file = File::open(path).map_err(|err| {
        ForgeError::io(format!("failed to open {} for hashing", path.display()), err)
    })?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = reader
            .read(&mut buffer)
            .map_err(|err| ForgeError::io(format!("failed to read {}", path.display()), err))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Write a `SHA256SUMS` style listing for `files` into `output`. Entries are
/// named relative to the listing's directory and sorted by name.
pub fn write_checksums(files: &[PathBuf], output: &Path) -> ForgeResult<Vec<(String, String)>> {
    let base = output.parent().unwrap_or_else(|| Path::new(""));
    let mut entries = Vec::with_capacity(files.len());
    for file in files {
        let digest = compute_sha256(file)?;
        let name = file
            .strip_prefix(base)
            .unwrap_or(file)
            .to_string_lossy()
            .replace('\\', "/");
        entries.push((name, digest));
    }
    entries.sort();

    let mut body = String::new();
    for (name, digest) in &entries {
        body.push_str(&format!("{digest}  {name}\n"));
    }
    write_atomic(output, body.as_bytes())?;
    Ok(entries)
}

/// Write `bytes` to a sibling temp file and rename it over `path`, so readers
/// never observe a partially written file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> ForgeResult<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).map_err(|err| {
            ForgeError::io(format!("failed to create {}", parent.display()), err)
        })?;
    }

    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp)
        .map_err(|err| ForgeError::io(format!("failed to create {}", tmp.display()), err))?;
    file.write_all(bytes)
        .and_then(|_| file.sync_all())
        .map_err(|err| ForgeError::io(format!("failed to write {}", tmp.display()), err))?;
    drop(file);

    std::fs::rename(&tmp, path).map_err(|err| {
        ForgeError::io(
            format!("failed to move {} into place", path.display()),
            err,
        )
    })
}

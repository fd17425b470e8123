//! Zip packaging and hashing of result folders

use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;

/// Zip the content of `source` into `destination`, paths relative to `source`
pub fn zip_dir(source: &Path, destination: &Path) -> zip::result::ZipResult<()> {
    let file = File::create(destination)?;
    let mut zip = zip::ZipWriter::new(file);
    let options =
        SimpleFileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in WalkDir::new(source).sort_by_file_name() {
        let entry = entry.map_err(|e| zip::result::ZipError::Io(e.into()))?;
        let path = entry.path();
        let Ok(relative) = path.strip_prefix(source) else {
            continue;
        };
        if relative.as_os_str().is_empty() {
            continue;
        }
        let name = relative.to_string_lossy().replace('\\', "/");

        if entry.file_type().is_dir() {
            zip.add_directory(name, options)?;
        } else if entry.file_type().is_file() {
            zip.start_file(name, options)?;
            let mut content = Vec::new();
            File::open(path)?.read_to_end(&mut content)?;
            zip.write_all(&content)?;
        }
    }

    zip.finish()?;
    Ok(())
}

/// sha256 of `data` as 0x-prefixed hex
pub fn sha256_hex(data: &[u8]) -> String {
    format!("0x{}", hex::encode(Sha256::digest(data)))
}

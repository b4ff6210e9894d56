use std::fs;
use std::io::Write;
use std::path::Path;

use zip::write::FileOptions;

use super::naming::slash_path;
use crate::error::ArchiveError;

/// Zips every file below `dir` into `out_path`, with entry names relative
/// to `dir`. Returns the size of the written archive.
///
/// # Errors
///
/// Returns an error when the tree cannot be walked or the archive written.
pub fn zip_dir(dir: &Path, out_path: &Path) -> Result<u64, ArchiveError> {
    let file = fs::File::create(out_path).map_err(|source| ArchiveError::Io {
        context: "creating archive",
        path: out_path.to_path_buf(),
        source,
    })?;
    let mut zip = zip::ZipWriter::new(file);
    let opts = FileOptions::default().compression_method(zip::CompressionMethod::Deflated);

    for entry in walkdir::WalkDir::new(dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let relative = path
            .strip_prefix(dir)
            .map_err(|_err| ArchiveError::OutsideBase {
                path: path.to_path_buf(),
            })?;
        zip.start_file(slash_path(relative), opts)?;
        let data = fs::read(path).map_err(|source| ArchiveError::Io {
            context: "reading archive entry",
            path: path.to_path_buf(),
            source,
        })?;
        zip.write_all(&data).map_err(|source| ArchiveError::Io {
            context: "compressing archive entry",
            path: path.to_path_buf(),
            source,
        })?;
    }

    let file = zip.finish()?;
    let size = file
        .metadata()
        .map_err(|source| ArchiveError::Io {
            context: "reading archive size",
            path: out_path.to_path_buf(),
            source,
        })?
        .len();
    Ok(size)
}

/// Extracts a zip archive into `dir`.
///
/// # Errors
///
/// Returns an error when the archive cannot be read or extracted.
pub fn extract_zip(archive: &Path, dir: &Path) -> Result<(), ArchiveError> {
    let file = fs::File::open(archive).map_err(|source| ArchiveError::Io {
        context: "opening archive",
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = zip::ZipArchive::new(file)?;
    zip.extract(dir)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zipped_tree_extracts_back() -> Result<(), String> {
        let source = tempfile::tempdir().map_err(|err| err.to_string())?;
        let nested = source.path().join("suite").join("test");
        fs::create_dir_all(&nested).map_err(|err| err.to_string())?;
        fs::write(source.path().join("data.json"), b"{}").map_err(|err| err.to_string())?;
        fs::write(nested.join("data.json"), b"{\"id\": 2}").map_err(|err| err.to_string())?;

        let out = tempfile::tempdir().map_err(|err| err.to_string())?;
        let zip_path = out.path().join("archive.zip");
        let size = zip_dir(source.path(), &zip_path).map_err(|err| err.to_string())?;
        if size == 0 {
            return Err("Archive should not be empty".to_owned());
        }

        let target = out.path().join("extracted");
        extract_zip(&zip_path, &target).map_err(|err| err.to_string())?;
        let restored = fs::read_to_string(target.join("suite/test/data.json"))
            .map_err(|err| err.to_string())?;
        if restored != "{\"id\": 2}" {
            return Err(format!("Unexpected content {restored}"));
        }
        Ok(())
    }
}

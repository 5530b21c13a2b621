use std::{
    fs::File,
    io,
    path::Path,
};

use zip::{write::SimpleFileOptions, CompressionMethod, ZipWriter};

use crate::ModelpackResult;

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Packages a directory tree into a deflate-compressed zip archive.
///
/// Entries are named relative to `root` with forward slashes, directories are
/// written explicitly (trailing `/`), file modes are preserved, and children
/// are visited in name order so the archive layout is deterministic.
pub fn zip_dir(root: &Path, out_zip: &Path) -> ModelpackResult<()> {
    let out = File::create(out_zip)?;
    let mut writer = ZipWriter::new(out);
    add_entries(&mut writer, root, "")?;
    writer.finish()?;
    Ok(())
}

fn add_entries(
    writer: &mut ZipWriter<File>,
    dir: &Path,
    prefix: &str,
) -> ModelpackResult<()> {
    let mut children: Vec<_> = std::fs::read_dir(dir)?.collect::<io::Result<Vec<_>>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let name = child.file_name().to_string_lossy().into_owned();
        let entry_name = if prefix.is_empty() {
            name
        } else {
            format!("{prefix}/{name}")
        };
        let metadata = child.metadata()?;
        let options = file_options(&metadata);

        if metadata.is_dir() {
            writer.add_directory(entry_name.as_str(), options)?;
            add_entries(writer, &child.path(), &entry_name)?;
        } else {
            writer.start_file(entry_name.as_str(), options)?;
            let mut file = File::open(child.path())?;
            io::copy(&mut file, writer)?;
        }
    }
    Ok(())
}

#[cfg(unix)]
fn file_options(metadata: &std::fs::Metadata) -> SimpleFileOptions {
    use std::os::unix::fs::PermissionsExt;

    SimpleFileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .unix_permissions(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn file_options(_metadata: &std::fs::Metadata) -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

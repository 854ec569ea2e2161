//! Archive unpacking for registry downloads.
//!
//! The archive type is decided by the file name suffix. Supported:
//! `.tar`, `.tar.gz`/`.tgz`, `.tar.bz2`/`.tbz2`, `.tar.xz`/`.txz`, `.zip`.

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::util::errors::ErrorKind;

#[derive(Debug, Error)]
pub enum ArchiveError {
    #[error("unknown archive format of `{name}`; expected .tar, .tar.gz, .tgz, .tar.bz2, .tbz2, .tar.xz, .txz or .zip")]
    UnknownFormat { name: String },

    #[error("failed to unpack {}", .path.display())]
    Extract {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to read zip archive {}", .path.display())]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },

    #[error("archive entry `{entry}` escapes the destination directory")]
    UnsafePath { entry: String },
}

impl ArchiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ArchiveError::UnknownFormat { .. } => ErrorKind::Environment,
            _ => ErrorKind::Integrity,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    TarBz2,
    TarXz,
    Zip,
}

impl ArchiveKind {
    /// Detect the archive kind from a file name or URL path.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.to_ascii_lowercase();
        let name = name.split(['?', '#']).next().unwrap_or(&name);

        const SUFFIXES: &[(&str, ArchiveKind)] = &[
            (".tar.gz", ArchiveKind::TarGz),
            (".tgz", ArchiveKind::TarGz),
            (".tar.bz2", ArchiveKind::TarBz2),
            (".tbz2", ArchiveKind::TarBz2),
            (".tar.xz", ArchiveKind::TarXz),
            (".txz", ArchiveKind::TarXz),
            (".tar", ArchiveKind::Tar),
            (".zip", ArchiveKind::Zip),
        ];
        SUFFIXES
            .iter()
            .find(|(suffix, _)| name.ends_with(suffix))
            .map(|(_, kind)| *kind)
    }

    /// Like [`from_name`](Self::from_name) but fails on unknown suffixes.
    pub fn detect(name: &str) -> Result<Self, ArchiveError> {
        Self::from_name(name).ok_or_else(|| ArchiveError::UnknownFormat {
            name: name.to_string(),
        })
    }

    /// File extension including the leading dot.
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveKind::Tar => ".tar",
            ArchiveKind::TarGz => ".tar.gz",
            ArchiveKind::TarBz2 => ".tar.bz2",
            ArchiveKind::TarXz => ".tar.xz",
            ArchiveKind::Zip => ".zip",
        }
    }
}

/// Unpack `archive` into `dest`, which is created if needed.
pub fn extract(archive: &Path, kind: ArchiveKind, dest: &Path) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Extract {
        path: archive.to_path_buf(),
        source,
    };

    std::fs::create_dir_all(dest).map_err(io_err)?;
    let file = BufReader::new(File::open(archive).map_err(io_err)?);

    match kind {
        ArchiveKind::Tar => unpack_tar(file, archive, dest),
        ArchiveKind::TarGz => unpack_tar(flate2::read::GzDecoder::new(file), archive, dest),
        ArchiveKind::TarBz2 => unpack_tar(bzip2::read::BzDecoder::new(file), archive, dest),
        ArchiveKind::TarXz => unpack_tar(xz2::read::XzDecoder::new(file), archive, dest),
        ArchiveKind::Zip => unpack_zip(archive, dest),
    }?;

    tracing::debug!("unpacked {} into {}", archive.display(), dest.display());
    Ok(())
}

fn unpack_tar<R: Read>(reader: R, archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Extract {
        path: archive.to_path_buf(),
        source,
    };

    let mut tar = tar::Archive::new(reader);
    tar.set_preserve_permissions(true);

    for entry in tar.entries().map_err(io_err)? {
        let mut entry = entry.map_err(io_err)?;
        let entry_type = entry.header().entry_type();
        if !(entry_type.is_file() || entry_type.is_dir() || entry_type.is_symlink() || entry_type.is_hard_link()) {
            tracing::debug!("skipping archive entry of type {:?}", entry_type);
            continue;
        }
        // unpack_in refuses paths outside dest and reports it as `false`
        if !entry.unpack_in(dest).map_err(io_err)? {
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            return Err(ArchiveError::UnsafePath { entry: name });
        }
    }
    Ok(())
}

fn unpack_zip(archive: &Path, dest: &Path) -> Result<(), ArchiveError> {
    let io_err = |source| ArchiveError::Extract {
        path: archive.to_path_buf(),
        source,
    };
    let zip_err = |source| ArchiveError::Zip {
        path: archive.to_path_buf(),
        source,
    };

    let file = File::open(archive).map_err(io_err)?;
    let mut zip = zip::ZipArchive::new(file).map_err(zip_err)?;

    for i in 0..zip.len() {
        let mut entry = zip.by_index(i).map_err(zip_err)?;
        let rel = entry
            .enclosed_name()
            .ok_or_else(|| ArchiveError::UnsafePath {
                entry: entry.name().to_string(),
            })?;
        let out = dest.join(rel);

        if entry.is_dir() {
            std::fs::create_dir_all(&out).map_err(io_err)?;
            continue;
        }
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let mut target = File::create(&out).map_err(io_err)?;
        io::copy(&mut entry, &mut target).map_err(io_err)?;

        #[cfg(unix)]
        if let Some(mode) = entry.unix_mode() {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&out, std::fs::Permissions::from_mode(mode))
                .map_err(io_err)?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_detect_kind() {
        assert_eq!(ArchiveKind::from_name("cmp_1.0.0.tgz"), Some(ArchiveKind::TarGz));
        assert_eq!(
            ArchiveKind::from_name("https://x/cmp.TAR.GZ?sig=1"),
            Some(ArchiveKind::TarGz)
        );
        assert_eq!(ArchiveKind::from_name("a.tar.bz2"), Some(ArchiveKind::TarBz2));
        assert_eq!(ArchiveKind::from_name("a.txz"), Some(ArchiveKind::TarXz));
        assert_eq!(ArchiveKind::from_name("a.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_name("a.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_name("a.rar"), None);

        let err = ArchiveKind::detect("a.7z").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Environment);
    }

    #[test]
    fn test_extract_tar_gz() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("cmp.tgz");

        let file = File::create(&archive).unwrap();
        let enc = flate2::write::GzEncoder::new(file, flate2::Compression::default());
        let mut builder = tar::Builder::new(enc);
        let data = b"int main;";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "src/main.c", &data[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let dest = tmp.path().join("out");
        extract(&archive, ArchiveKind::TarGz, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("src/main.c")).unwrap(),
            "int main;"
        );
    }

    #[test]
    fn test_extract_zip() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("cmp.zip");

        let file = File::create(&archive).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        writer
            .start_file("include/cmp.h", zip::write::SimpleFileOptions::default())
            .unwrap();
        writer.write_all(b"#pragma once").unwrap();
        writer.finish().unwrap();

        let dest = tmp.path().join("out");
        extract(&archive, ArchiveKind::Zip, &dest).unwrap();
        assert_eq!(
            std::fs::read_to_string(dest.join("include/cmp.h")).unwrap(),
            "#pragma once"
        );
    }

    #[test]
    fn test_corrupt_archive() {
        let tmp = TempDir::new().unwrap();
        let archive = tmp.path().join("bad.tar.gz");
        std::fs::write(&archive, b"not gzip").unwrap();

        let err = extract(&archive, ArchiveKind::TarGz, &tmp.path().join("out")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Integrity);
    }
}

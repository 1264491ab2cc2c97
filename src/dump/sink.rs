use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use flate2::write::GzEncoder;
use flate2::Compression;

use crate::error::DumpError;

const INSERT_PREFIX: &[u8] = b"INSERT INTO `";
const FILE_EXT: &str = ".sql";

/// Write-close endpoint for dump bytes.
pub trait Sink: Send + Sync {
    fn write(&self, payload: &[u8]) -> Result<(), DumpError>;

    fn close(&self) -> Result<(), DumpError>;
}

enum FileBody {
    Plain(BufWriter<File>),
    Gzip(GzEncoder<BufWriter<File>>),
}

/// One output file. Writes go through a mutex; `close` consumes the body
/// so a handle can only be closed once.
pub struct FileHandle {
    name: String,
    body: Mutex<Option<FileBody>>,
}

impl FileHandle {
    fn create(dir: &Path, name: &str, gzip: bool, level: Compression) -> Result<Self, DumpError> {
        fs::create_dir_all(dir)?;

        let file_name = if gzip {
            format!("{name}.gz")
        } else {
            name.to_string()
        };

        let path = dir.join(&file_name);
        if path.exists() {
            fs::remove_file(&path)?;
        }

        let file = BufWriter::new(File::create(&path)?);
        let body = if gzip {
            FileBody::Gzip(GzEncoder::new(file, level))
        } else {
            FileBody::Plain(file)
        };

        Ok(Self {
            name: name.to_string(),
            body: Mutex::new(Some(body)),
        })
    }

    pub fn write(&self, payload: &[u8]) -> Result<(), DumpError> {
        let mut body = self.body.lock().unwrap_or_else(PoisonError::into_inner);

        match body.as_mut() {
            Some(FileBody::Plain(writer)) => writer.write_all(payload)?,
            Some(FileBody::Gzip(writer)) => writer.write_all(payload)?,
            None => return Err(DumpError::SinkClosed(self.name.clone())),
        }

        Ok(())
    }

    fn close(&self) -> Result<(), DumpError> {
        let body = self
            .body
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        match body {
            Some(FileBody::Plain(mut writer)) => writer.flush()?,
            Some(FileBody::Gzip(writer)) => writer.finish()?.flush()?,
            None => {}
        }

        Ok(())
    }
}

/// Single-file sink; the schema file uses this.
pub struct FileSink {
    handle: FileHandle,
}

impl FileSink {
    pub fn create(dir: &Path, name: &str, gzip: bool, level: Compression) -> Result<Self, DumpError> {
        Ok(Self {
            handle: FileHandle::create(dir, name, gzip, level)?,
        })
    }
}

impl Sink for FileSink {
    fn write(&self, payload: &[u8]) -> Result<(), DumpError> {
        self.handle.write(payload)
    }

    fn close(&self) -> Result<(), DumpError> {
        self.handle.close()
    }
}

/// Routes self-describing INSERT payloads to per-table files. A file is
/// created on first reference, cached in the name map, and closed exactly
/// once by `close`; the router is the single closer for every handle it
/// hands out.
pub struct DirSink {
    dir: PathBuf,
    gzip: bool,
    level: Compression,
    files: Mutex<HashMap<String, Arc<FileHandle>>>,
}

impl DirSink {
    pub fn create(dir: &Path, gzip: bool, level: Compression) -> Result<Self, DumpError> {
        fs::create_dir_all(dir)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            gzip,
            level,
            files: Mutex::new(HashMap::new()),
        })
    }

    /// Get or create the data file for `table`. Used by the orchestrator
    /// to materialise the file (and write its header) before any INSERT
    /// payload routes itself here.
    pub fn open(&self, table: &str) -> Result<Arc<FileHandle>, DumpError> {
        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(handle) = files.get(table) {
            return Ok(Arc::clone(handle));
        }

        let handle = Arc::new(FileHandle::create(
            &self.dir,
            &format!("{table}{FILE_EXT}"),
            self.gzip,
            self.level,
        )?);
        files.insert(table.to_string(), Arc::clone(&handle));

        Ok(handle)
    }
}

impl Sink for DirSink {
    fn write(&self, payload: &[u8]) -> Result<(), DumpError> {
        let table = parse_target(payload)?;
        let handle = self.open(table)?;
        handle.write(payload)
    }

    fn close(&self) -> Result<(), DumpError> {
        let files: Vec<_> = {
            let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
            files.drain().collect()
        };

        let mut first_err = None;
        for (_, handle) in files {
            if let Err(err) = handle.close() {
                first_err.get_or_insert(err);
            }
        }

        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Find the table name between ``INSERT INTO ` `` and the closing backtick.
fn parse_target(payload: &[u8]) -> Result<&str, DumpError> {
    let start = payload
        .windows(INSERT_PREFIX.len())
        .position(|window| window == INSERT_PREFIX)
        .ok_or(DumpError::UnparsedSinkTarget)?
        + INSERT_PREFIX.len();

    let len = payload[start..]
        .iter()
        .position(|&b| b == b'`')
        .ok_or(DumpError::UnparsedSinkTarget)?;

    if len == 0 {
        return Err(DumpError::UnparsedSinkTarget);
    }

    std::str::from_utf8(&payload[start..start + len]).map_err(|_| DumpError::UnparsedSinkTarget)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_parse_target() {
        assert_eq!(
            parse_target(b"INSERT INTO `users` VALUES (1)").unwrap(),
            "users"
        );
        assert_eq!(
            parse_target(b"-- header\n\nINSERT INTO `t` VALUES (1);\n").unwrap(),
            "t"
        );

        assert!(parse_target(b"").is_err());
        assert!(parse_target(b"INSERT INTO `").is_err());
        assert!(parse_target(b"INSERT INTO `` VALUES (1)").is_err());
        assert!(parse_target(b"UPDATE `t` SET x = 1").is_err());
    }

    #[test]
    fn test_dir_sink_routing() {
        let cases: &[(&[u8], bool)] = &[
            (b"INSERT INTO `", true),
            (b"--\n--\nCREATE TABLE IF NOT EXISTS", true),
            (b"", true),
            (b"INSERT INTO `table` VALUES (1, 'test')", false),
            (
                b"--\ntable's data [count=8876]\n\nINSERT INTO `table` VALUES (1, 'test');\n",
                false,
            ),
            (b"UPDATE `table` SET name = 'test'", true),
        ];

        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::create(dir.path(), false, Compression::fast()).unwrap();

        for (i, (payload, want_err)) in cases.iter().enumerate() {
            let result = sink.write(payload);
            assert_eq!(result.is_err(), *want_err, "case {i}");
        }

        sink.close().unwrap();

        let written = fs::read(dir.path().join("table.sql")).unwrap();
        let expected = [cases[3].0, cases[4].0].concat();
        assert_eq!(written, expected);
    }

    #[test]
    fn test_open_creates_file_for_empty_tables() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::create(dir.path(), false, Compression::fast()).unwrap();

        sink.open("empty").unwrap();
        sink.close().unwrap();

        let meta = fs::metadata(dir.path().join("empty.sql")).unwrap();
        assert_eq!(meta.len(), 0);
    }

    #[test]
    fn test_open_returns_cached_handle() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::create(dir.path(), false, Compression::fast()).unwrap();

        let first = sink.open("t").unwrap();
        let second = sink.open("t").unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        sink.close().unwrap();
    }

    #[test]
    fn test_gzip_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let sink = DirSink::create(dir.path(), true, Compression::fast()).unwrap();

        let payload: &[u8] = b"INSERT INTO `t` VALUES (1,'x');\n";
        sink.write(payload).unwrap();
        sink.close().unwrap();

        let file = File::open(dir.path().join("t.sql.gz")).unwrap();
        let mut decoded = Vec::new();
        flate2::read::GzDecoder::new(file)
            .read_to_end(&mut decoded)
            .unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn test_file_sink_write_after_close_fails() {
        let dir = tempfile::tempdir().unwrap();
        let sink = FileSink::create(dir.path(), "__dll.sql", false, Compression::fast()).unwrap();

        sink.write(b"CREATE TABLE `t` (`id` int);\n").unwrap();
        sink.close().unwrap();

        let err = sink.write(b"more").unwrap_err();
        assert!(matches!(err, DumpError::SinkClosed(_)));

        // closing twice is a no-op
        sink.close().unwrap();
    }

    #[test]
    fn test_create_truncates_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("t.sql"), b"stale").unwrap();

        let sink = DirSink::create(dir.path(), false, Compression::fast()).unwrap();
        sink.open("t").unwrap();
        sink.close().unwrap();

        let meta = fs::metadata(dir.path().join("t.sql")).unwrap();
        assert_eq!(meta.len(), 0);
    }
}

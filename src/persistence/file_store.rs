// 文件会话存储
//
// 所有会话保存在同一个 JSON 文件中（缓存键 -> 记录）

use super::{SessionRecord, SessionStore};
use crate::error::{Result, TransferError};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

type SessionMap = BTreeMap<String, SessionRecord>;

#[derive(Debug)]
pub struct FileSessionStore {
    path: PathBuf,
    /// 串行化本进程内的读-改-写
    lock: Mutex<()>,
}

impl FileSessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 读取全部记录
    ///
    /// 文件不存在视为空；文件损坏时记录警告并视为空，避免一个坏文件阻塞所有上传
    fn load(&self) -> SessionMap {
        if !self.path.exists() {
            return SessionMap::new();
        }

        let result = File::open(&self.path).and_then(|file| {
            serde_json::from_reader::<_, SessionMap>(BufReader::new(file))
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
        });

        match result {
            Ok(map) => map,
            Err(e) => {
                warn!("加载会话缓存失败 {:?}: {}", self.path, e);
                SessionMap::new()
            }
        }
    }

    /// 写入全部记录（临时文件 + 原子重命名）
    fn save(&self, map: &SessionMap) -> io::Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                debug!("已创建目录: {:?}", parent);
            }
        }

        let temp_path = self.path.with_extension("json.tmp");
        let file = File::create(&temp_path)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut writer, map)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        writer.flush()?;
        drop(writer);

        fs::rename(&temp_path, &self.path)
    }

    fn update<F>(&self, key: &str, apply: F) -> Result<()>
    where
        F: FnOnce(&mut SessionMap),
    {
        let _guard = self.lock.lock();
        let mut map = self.load();
        apply(&mut map);
        self.save(&map).map_err(|e| {
            TransferError::Persistence(format!("写入会话缓存失败 {}: {}", key, e))
        })
    }
}

impl SessionStore for FileSessionStore {
    fn get(&self, key: &str) -> Result<Option<SessionRecord>> {
        let _guard = self.lock.lock();
        Ok(self.load().remove(key))
    }

    fn set(&self, key: &str, record: &SessionRecord) -> Result<()> {
        self.update(key, |map| {
            map.insert(key.to_string(), record.clone());
        })?;
        debug!("已保存会话记录: {}", key);
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.update(key, |map| {
            map.remove(key);
        })?;
        debug!("已删除会话记录: {}", key);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_set_and_get_across_instances() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("sessions.json");

        let store = FileSessionStore::new(&path);
        let mut record = SessionRecord::new("https://upload/1", Some(5));
        record.first_chunk = Some("aGVsbG8=".to_string());
        store.set("b/o/5", &record).unwrap();

        // 新实例（模拟新进程）能读到同一记录
        let reopened = FileSessionStore::new(&path);
        assert_eq!(reopened.get("b/o/5").unwrap(), Some(record));
        assert!(reopened.get("b/other").unwrap().is_none());
        assert!(!path.with_extension("json.tmp").exists());
    }

    #[test]
    fn test_keys_do_not_collide() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path().join("sessions.json"));

        store.set("b/a", &SessionRecord::new("uri-a", None)).unwrap();
        store.set("b/b", &SessionRecord::new("uri-b", None)).unwrap();
        store.delete("b/a").unwrap();

        assert!(store.get("b/a").unwrap().is_none());
        assert_eq!(store.get("b/b").unwrap().unwrap().uri, "uri-b");
    }

    #[test]
    fn test_corrupt_file_treated_as_empty() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("sessions.json");
        fs::write(&path, "{ not json").unwrap();

        let store = FileSessionStore::new(&path);
        assert!(store.get("b/o").unwrap().is_none());

        store.set("b/o", &SessionRecord::new("uri", None)).unwrap();
        assert_eq!(store.get("b/o").unwrap().unwrap().uri, "uri");
    }

    #[test]
    fn test_delete_missing_key() {
        let temp_dir = TempDir::new().unwrap();
        let store = FileSessionStore::new(temp_dir.path().join("sessions.json"));
        assert!(store.delete("nothing").is_ok());
    }
}

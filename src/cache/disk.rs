//! Disk Cache
//!
//! Each entry is a single file named by the SHA-1 of the request key: one
//! line of JSON metadata, then the body. Writes go through a temp file and
//! one rename, so readers see either the old entry or the new one, never a
//! mix of the two.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use super::{ensure_get, Cache, CacheError, CacheMatch, CacheStorage};
use crate::net::{Request, Response};
use crate::storage_root::{remove_temp_files, StorageRoot, TEMP_EXT};

/// File extension of committed entries
const ENTRY_EXT: &str = "entry";

/// First line of each entry file
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EntryMeta {
    /// Request key the entry was stored under
    key: String,
    status: u16,
    headers: Vec<(String, String)>,
    /// Bytes following the metadata line
    body_len: u64,
}

/// Opens disk caches below a storage root
pub struct DiskCacheStorage {
    root: StorageRoot,
}

impl DiskCacheStorage {
    pub fn new(root: StorageRoot) -> Self {
        Self { root }
    }

    /// Remove temp files left by interrupted writes to a named cache.
    ///
    /// Only safe before the cache is shared with any writer.
    pub async fn cleanup(&self, name: &str) -> Result<usize, CacheError> {
        Ok(remove_temp_files(&self.root.cache_dir(name)).await?)
    }
}

#[async_trait]
impl CacheStorage for DiskCacheStorage {
    async fn open(&self, name: &str) -> Result<Arc<dyn Cache>, CacheError> {
        let cache_dir = self.root.cache_dir(name);
        tokio::fs::create_dir_all(&cache_dir).await?;
        Ok(Arc::new(DiskCache { cache_dir }))
    }
}

/// A named cache on disk
pub struct DiskCache {
    cache_dir: PathBuf,
}

/// An entry ready to be written
struct PendingEntry {
    path: PathBuf,
    contents: Vec<u8>,
}

impl DiskCache {
    /// Entry file for a request key
    fn entry_path(&self, request: &Request) -> PathBuf {
        let mut hasher = Sha1::new();
        hasher.update(request.cache_key().as_bytes());
        self.cache_dir
            .join(format!("{:x}.{}", hasher.finalize(), ENTRY_EXT))
    }

    /// Serialize an entry without touching the disk
    fn encode(&self, request: &Request, response: &Response) -> Result<PendingEntry, CacheError> {
        ensure_get(request)?;
        let meta = EntryMeta {
            key: request.cache_key(),
            status: response.status,
            headers: response.headers.clone(),
            body_len: response.body.len() as u64,
        };

        // Compact JSON never contains a raw newline
        let mut contents = serde_json::to_vec(&meta)?;
        contents.push(b'\n');
        contents.extend_from_slice(&response.body);

        Ok(PendingEntry {
            path: self.entry_path(request),
            contents,
        })
    }

    /// Write entries on the blocking pool; all of them land or none do
    async fn write(&self, entries: Vec<PendingEntry>) -> Result<(), CacheError> {
        let dir = self.cache_dir.clone();
        tokio::task::spawn_blocking(move || write_entries(&dir, entries))
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))??;
        Ok(())
    }
}

/// Split an entry file into its metadata and body
fn decode(bytes: Vec<u8>) -> Result<(EntryMeta, Vec<u8>), CacheError> {
    let newline = bytes
        .iter()
        .position(|&b| b == b'\n')
        .ok_or_else(|| CacheError::Corrupt("missing metadata line".to_string()))?;
    let meta: EntryMeta = serde_json::from_slice(&bytes[..newline])?;
    let body = bytes[newline + 1..].to_vec();
    if body.len() as u64 != meta.body_len {
        return Err(CacheError::Corrupt(format!(
            "expected {} body bytes, found {}",
            meta.body_len,
            body.len()
        )));
    }
    Ok((meta, body))
}

#[async_trait]
impl Cache for DiskCache {
    async fn put(&self, request: &Request, response: &Response) -> Result<(), CacheError> {
        let entry = self.encode(request, response)?;
        self.write(vec![entry]).await?;
        debug!(url = %request.url, status = response.status, "Stored response in cache");
        Ok(())
    }

    async fn match_request(&self, request: &Request) -> Result<CacheMatch, CacheError> {
        if !request.is_get() {
            return Ok(CacheMatch::NotFound);
        }

        let bytes = match tokio::fs::read(self.entry_path(request)).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(CacheMatch::NotFound),
            Err(e) => return Err(e.into()),
        };
        let (meta, body) = decode(bytes)?;
        if meta.key != request.cache_key() {
            // SHA-1 collision; treat as absent
            return Ok(CacheMatch::NotFound);
        }

        Ok(CacheMatch::Found(Response {
            status: meta.status,
            headers: meta.headers,
            body,
        }))
    }

    async fn put_all(&self, entries: Vec<(Request, Response)>) -> Result<(), CacheError> {
        let count = entries.len();
        let pending = entries
            .iter()
            .map(|(request, response)| self.encode(request, response))
            .collect::<Result<Vec<_>, _>>()?;
        self.write(pending).await?;
        info!(dir = %self.cache_dir.display(), count = count, "Populated cache");
        Ok(())
    }
}

fn temp_in(dir: &Path, prefix: &str) -> io::Result<NamedTempFile> {
    tempfile::Builder::new()
        .prefix(prefix)
        .suffix(&format!(".{}", TEMP_EXT))
        .tempfile_in(dir)
}

/// Copy of an existing entry, or `None` when there is none
fn backup(dir: &Path, path: &Path) -> io::Result<Option<NamedTempFile>> {
    let mut current = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut copy = temp_in(dir, ".backup-")?;
    io::copy(&mut current, &mut copy)?;
    Ok(Some(copy))
}

/// Write every entry through its own temp file and rename.
///
/// When a later entry fails, the ones already renamed into place are put
/// back the way they were.
fn write_entries(dir: &Path, entries: Vec<PendingEntry>) -> io::Result<()> {
    // Stage everything before anything becomes visible
    let mut staged = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut tmp = temp_in(dir, ".entry-")?;
        tmp.write_all(&entry.contents)?;
        staged.push((tmp, entry.path));
    }

    // A lone put has nothing to roll back
    let keep_backups = staged.len() > 1;
    let mut committed: Vec<(PathBuf, Option<NamedTempFile>)> = Vec::new();
    for (tmp, path) in staged {
        match commit(dir, tmp, &path, keep_backups) {
            Ok(previous) => committed.push((path, previous)),
            Err(e) => {
                rollback(committed);
                return Err(e);
            }
        }
    }
    Ok(())
}

/// Rename one staged entry into place, returning what it replaced
fn commit(
    dir: &Path,
    tmp: NamedTempFile,
    path: &Path,
    keep_backup: bool,
) -> io::Result<Option<NamedTempFile>> {
    let previous = if keep_backup { backup(dir, path)? } else { None };
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(previous)
}

fn rollback(committed: Vec<(PathBuf, Option<NamedTempFile>)>) {
    for (path, previous) in committed.into_iter().rev() {
        let restored = match previous {
            Some(backup) => backup.persist(&path).map(|_| ()).map_err(|e| e.error),
            None => fs::remove_file(&path),
        };
        if let Err(e) = restored {
            warn!(path = %path.display(), error = %e, "Could not roll back cache entry");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::{Fetcher, NetworkError};
    use reqwest::{Method, Url};

    fn request(path: &str) -> Request {
        Request::get(Url::parse(&format!("http://origin.test/{}", path)).unwrap())
    }

    async fn open(tmp: &tempfile::TempDir) -> Arc<dyn Cache> {
        DiskCacheStorage::new(StorageRoot::new(tmp.path()))
            .open("storage-testing")
            .await
            .unwrap()
    }

    /// Serves fixed responses; unknown paths fail at the transport level
    struct StaticFetcher;

    #[async_trait]
    impl Fetcher for StaticFetcher {
        async fn fetch(&self, request: &Request) -> Result<Response, NetworkError> {
            match request.url.path() {
                "/index.html" => Ok(Response::new(200, "<html>")),
                "/storage.js" => Ok(Response::new(200, "js")),
                "/gone" => Ok(Response::new(410, "")),
                _ => Err(NetworkError::Transport("unreachable".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_put_then_match() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(&tmp).await;
        let mut response = Response::new(200, "hello");
        response
            .headers
            .push(("content-type".to_string(), "text/plain".to_string()));

        cache.put(&request("a"), &response).await.unwrap();

        assert_eq!(
            cache.match_request(&request("a")).await.unwrap(),
            CacheMatch::Found(response)
        );
        assert_eq!(
            cache.match_request(&request("b")).await.unwrap(),
            CacheMatch::NotFound
        );
    }

    #[tokio::test]
    async fn test_put_overwrites_in_place() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(&tmp).await;
        cache.put(&request("a"), &Response::new(200, "old")).await.unwrap();
        cache.put(&request("a"), &Response::new(200, "new")).await.unwrap();

        match cache.match_request(&request("a")).await.unwrap() {
            CacheMatch::Found(r) => assert_eq!(r.body, b"new"),
            CacheMatch::NotFound => panic!("Expected cached entry"),
        }
    }

    #[tokio::test]
    async fn test_entries_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        open(&tmp)
            .await
            .put(&request("a"), &Response::new(200, "kept"))
            .await
            .unwrap();

        let reopened = open(&tmp).await;
        assert!(matches!(
            reopened.match_request(&request("a")).await.unwrap(),
            CacheMatch::Found(_)
        ));
    }

    #[tokio::test]
    async fn test_non_get_is_never_stored_or_matched() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(&tmp).await;
        let post = Request::new(Method::POST, request("a").url);

        let err = cache.put(&post, &Response::new(200, "x")).await.unwrap_err();
        assert!(matches!(err, CacheError::MethodNotAllowed(_)));

        // A GET entry for the same URL does not answer a POST
        cache.put(&request("a"), &Response::new(200, "x")).await.unwrap();
        assert_eq!(cache.match_request(&post).await.unwrap(), CacheMatch::NotFound);
    }

    #[tokio::test]
    async fn test_add_all_stores_every_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(&tmp).await;

        cache
            .add_all(&[request("index.html"), request("storage.js")], &StaticFetcher)
            .await
            .unwrap();

        for path in ["index.html", "storage.js"] {
            assert!(matches!(
                cache.match_request(&request(path)).await.unwrap(),
                CacheMatch::Found(_)
            ));
        }
    }

    #[tokio::test]
    async fn test_add_all_is_all_or_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(&tmp).await;

        let err = cache
            .add_all(&[request("index.html"), request("missing")], &StaticFetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Network(_)));

        let err = cache
            .add_all(&[request("index.html"), request("gone")], &StaticFetcher)
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::BadStatus { status: 410, .. }));

        assert_eq!(
            cache.match_request(&request("index.html")).await.unwrap(),
            CacheMatch::NotFound
        );
    }

    #[tokio::test]
    async fn test_cleanup_removes_temp_files() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = StorageRoot::new(tmp.path()).cache_dir("storage-testing");
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join(".entry-x.tmp"), b"partial").unwrap();
        fs::write(dir.join("keep.entry"), b"{}").unwrap();

        let storage = DiskCacheStorage::new(StorageRoot::new(tmp.path()));
        // Opening leaves in-flight writes alone
        storage.open("storage-testing").await.unwrap();
        assert!(dir.join(".entry-x.tmp").exists());

        assert_eq!(storage.cleanup("storage-testing").await.unwrap(), 1);
        assert!(!dir.join(".entry-x.tmp").exists());
        assert!(dir.join("keep.entry").exists());
    }

    #[tokio::test]
    async fn test_truncated_entry_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache {
            cache_dir: StorageRoot::new(tmp.path()).cache_dir("storage-testing"),
        };
        fs::create_dir_all(&cache.cache_dir).unwrap();
        cache.put(&request("a"), &Response::new(200, "hello")).await.unwrap();

        let path = cache.entry_path(&request("a"));
        let mut bytes = fs::read(&path).unwrap();
        bytes.truncate(bytes.len() - 2);
        fs::write(&path, bytes).unwrap();

        let err = cache.match_request(&request("a")).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt(_)));
    }

    #[tokio::test]
    async fn test_failed_put_all_restores_earlier_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = DiskCache {
            cache_dir: StorageRoot::new(tmp.path()).cache_dir("storage-testing"),
        };
        fs::create_dir_all(&cache.cache_dir).unwrap();
        cache.put(&request("a"), &Response::new(200, "old")).await.unwrap();

        // A directory in the way makes the last rename fail
        fs::create_dir(cache.entry_path(&request("c"))).unwrap();

        let err = cache
            .put_all(vec![
                (request("a"), Response::new(200, "new")),
                (request("b"), Response::new(200, "b")),
                (request("c"), Response::new(200, "c")),
            ])
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Io(_)));

        assert_eq!(
            cache.match_request(&request("a")).await.unwrap(),
            CacheMatch::Found(Response::new(200, "old"))
        );
        assert_eq!(
            cache.match_request(&request("b")).await.unwrap(),
            CacheMatch::NotFound
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_put_and_match_see_whole_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let cache = open(&tmp).await;
        cache.put(&request("a"), &Response::new(200, "one")).await.unwrap();

        let writer_cache = Arc::clone(&cache);
        let writer = tokio::spawn(async move {
            for i in 0..500 {
                let response = if i % 2 == 0 {
                    Response::new(404, "two")
                } else {
                    Response::new(200, "one")
                };
                writer_cache.put(&request("a"), &response).await.unwrap();
            }
        });

        let mut reads = 0;
        while !writer.is_finished() || reads == 0 {
            match cache.match_request(&request("a")).await.unwrap() {
                CacheMatch::Found(r) => match r.status {
                    200 => assert_eq!(r.body, b"one"),
                    404 => assert_eq!(r.body, b"two"),
                    other => panic!("Unexpected status {other}"),
                },
                CacheMatch::NotFound => panic!("Entry vanished during overwrite"),
            }
            reads += 1;
        }
        writer.await.unwrap();
    }
}

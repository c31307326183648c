use std::{fs, io, path::{Path, PathBuf}};
use serde_json::Value;

use crate::errors::IngestError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawType {
    SpotifyAlbum,
    DiscogsRelease
}

/// Compressed on-disk archive of catalog payloads, one file per key
#[derive(Debug, Clone)]
pub struct DiskZstdSink {
    root: PathBuf,
    level: i32
}

fn io_err(what: String) -> impl FnOnce(io::Error) -> IngestError {
    move |e| IngestError::Io(io::Error::new(e.kind(), format!("{what}: {e}")))
}

impl DiskZstdSink {
    pub fn new(root: impl AsRef<Path>, level: i32) -> Self {
        Self { root: root.as_ref().to_path_buf(), level: level.clamp(0, 21) }
    }

    pub fn path_for(&self, kind: RawType, key: &str) -> PathBuf {
        self.root.join(Self::rel_path(kind, &Self::sanitize_key(key)))
    }

    pub fn write_json(&self, kind: RawType, key: &str, mut json: Value) ->
        Result<PathBuf, IngestError> {

        match kind {
            RawType::SpotifyAlbum => Self::prune_spotify_album(&mut json),
            RawType::DiscogsRelease => Self::prune_discogs_release(&mut json)
        }

        let path = self.path_for(kind, key);
        let parent = path.parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        fs::create_dir_all(&parent)
            .map_err(io_err(format!("create dir {}", parent.display())))?;

        let temp = tempfile::NamedTempFile::new_in(&parent)
            .map_err(io_err(format!("tempfile in {}", parent.display())))?;

        {
            let mut enc = zstd::stream::write::Encoder::new(temp.as_file(), self.level)
                .map_err(io_err("zstd encoder".to_string()))?;
            serde_json::to_writer(&mut enc, &json)?;
            enc.finish().map_err(io_err("zstd finish".to_string()))?;
        }

        temp.persist(&path)
            .map_err(|e| io_err(format!("persist {}", path.display()))(e.error))?;

        Ok(path)
    }

    pub fn read_json(&self, kind: RawType, key: &str) -> Result<Value, IngestError> {
        let path = self.path_for(kind, key);
        let file = fs::File::open(&path)
            .map_err(io_err(format!("open {}", path.display())))?;
        let dec = zstd::stream::read::Decoder::new(file)
            .map_err(io_err("zstd decoder".to_string()))?;
        Ok(serde_json::from_reader(dec)?)
    }

    fn rel_path(kind: RawType, sanitized_key: &str) -> PathBuf {
        let dir = match kind {
            RawType::SpotifyAlbum => "raw/spotify/album",
            RawType::DiscogsRelease => "raw/discogs/release"
        };
        PathBuf::from(dir).join(format!("{sanitized_key}.json.zst"))
    }

    fn sanitize_key(key: &str) -> String {
        key.chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect()
    }

    /// Drops keys we never map onto an album
    fn prune_spotify_album(v: &mut Value) {
        Self::drop_key(v, "available_markets");
        Self::drop_key(v, "images");
        Self::drop_key(v, "href");
        Self::drop_key(v, "uri");
        Self::drop_key(v, "copyrights");

        Self::drop_path(v, &["tracks", "href"]);
        Self::drop_path(v, &["tracks", "next"]);
        Self::drop_path(v, &["tracks", "previous"]);
        Self::drop_array_obj_key(v, &["tracks", "items"], "available_markets");
        Self::drop_array_obj_key(v, &["tracks", "items"], "preview_url");

        Self::drop_keys_recursive(v, &["href", "uri", "type"]);
    }

    fn prune_discogs_release(v: &mut Value) {
        Self::drop_key(v, "images");
        Self::drop_key(v, "videos");
        Self::drop_key(v, "community");
        Self::drop_key(v, "thumb");
        Self::drop_key(v, "cover_image");

        Self::drop_keys_recursive(v, &["resource_url", "thumbnail_url"]);
    }

    fn drop_key(v: &mut Value, key: &str) {
        if let Some(object) = v.as_object_mut() {
            object.remove(key);
        }
    }

    fn walk_mut<'a>(v: &'a mut Value, path: &[&str]) -> Option<&'a mut Value> {
        let mut curr = v;
        for segment in path {
            curr = curr.as_object_mut()?.get_mut(*segment)?;
        }
        Some(curr)
    }

    fn drop_path(v: &mut Value, path: &[&str]) {
        let Some((last_key, parents)) = path.split_last() else {
            return;
        };
        if let Some(Value::Object(map)) = Self::walk_mut(v, parents) {
            map.remove(*last_key);
        }
    }

    fn drop_array_obj_key(v: &mut Value, arr_path: &[&str], child_key: &str) {
        if let Some(Value::Array(arr)) = Self::walk_mut(v, arr_path) {
            for element in arr {
                if let Value::Object(object) = element {
                    object.remove(child_key);
                }
            }
        }
    }

    fn drop_keys_recursive(v: &mut Value, keys: &[&str]) {
        match v {
            Value::Object(map) => {
                for key in keys {
                    map.remove(*key);
                }
                for val in map.values_mut() {
                    Self::drop_keys_recursive(val, keys);
                }
            }
            Value::Array(arr) => {
                for element in arr {
                    Self::drop_keys_recursive(element, keys);
                }
            }
            _ => {}
        }
    }
}

use std::fs;
use std::path::PathBuf;

use num_enum::{IntoPrimitive, TryFromPrimitive};
use tracing::{debug, warn};

/// State objects the overlay asks us to persist. Only the identity pair and
///  the planet are written to disk; the rest is ephemeral by design.
#[derive(Debug, Clone, Copy, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StateObject {
    IdentityPublic = 0,
    IdentitySecret = 1,
    Planet = 2,
    Moon = 3,
    Peer = 4,
    NetworkConfig = 5,
}

const STATE_OBJECT_COUNT: usize = 6;

impl StateObject {
    fn file_name(self) -> Option<&'static str> {
        match self {
            StateObject::IdentityPublic => Some("identity.public"),
            StateObject::IdentitySecret => Some("identity.secret"),
            StateObject::Planet => Some("planet"),
            StateObject::Moon | StateObject::Peer | StateObject::NetworkConfig => None,
        }
    }
}

/// Overlay state persistence. With a home directory, persistable objects are
///  written by whole-file replacement; with an empty home, every object type
///  gets an in-memory slot instead, giving the node a throwaway identity.
pub struct StateStore {
    home: Option<PathBuf>,
    memory: [Option<Vec<u8>>; STATE_OBJECT_COUNT],
}

impl StateStore {
    pub fn new(home: &str) -> StateStore {
        StateStore {
            home: if home.is_empty() {
                None
            } else {
                Some(PathBuf::from(home))
            },
            memory: Default::default(),
        }
    }

    /// Stores (or, with `None`, deletes) an object. Failures are logged and
    ///  swallowed: the overlay re-issues state it considers important.
    pub fn put(&mut self, object: StateObject, data: Option<&[u8]>) {
        let Some(home) = &self.home else {
            self.memory[object as u8 as usize] = data.map(|d| d.to_vec());
            return;
        };

        let Some(file_name) = object.file_name() else {
            return;
        };
        let path = home.join(file_name);

        let result = match data {
            Some(data) => fs::write(&path, data),
            None => match fs::remove_file(&path) {
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                other => other,
            },
        };
        match result {
            Ok(()) => debug!("stored state object {:?} at {:?}", object, path),
            Err(e) => warn!("failed to store state object {:?} at {:?}: {}", object, path, e),
        }
    }

    /// Reads an object into `buf`, returning the number of bytes, or `None`
    ///  if the object is absent or larger than the buffer.
    pub fn get(&self, object: StateObject, buf: &mut [u8]) -> Option<usize> {
        let Some(home) = &self.home else {
            let data = self.memory[object as u8 as usize].as_ref()?;
            if data.len() > buf.len() {
                return None;
            }
            buf[..data.len()].copy_from_slice(data);
            return Some(data.len());
        };

        let path = home.join(object.file_name()?);
        let data = fs::read(&path).ok()?;
        if data.len() > buf.len() {
            return None;
        }
        buf[..data.len()].copy_from_slice(&data);
        Some(data.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_memory_roundtrip() {
        let mut store = StateStore::new("");
        let mut buf = [0u8; 16];

        assert_eq!(store.get(StateObject::Planet, &mut buf), None);

        store.put(StateObject::Planet, Some(b"abc"));
        assert_eq!(store.get(StateObject::Planet, &mut buf), Some(3));
        assert_eq!(&buf[..3], b"abc");

        // replace frees the previous contents
        store.put(StateObject::Planet, Some(b"defg"));
        assert_eq!(store.get(StateObject::Planet, &mut buf), Some(4));
        assert_eq!(&buf[..4], b"defg");

        store.put(StateObject::Planet, None);
        assert_eq!(store.get(StateObject::Planet, &mut buf), None);
    }

    #[test]
    fn test_memory_too_large_for_buffer() {
        let mut store = StateStore::new("");
        store.put(StateObject::IdentityPublic, Some(&[7u8; 32]));

        let mut small = [0u8; 8];
        assert_eq!(store.get(StateObject::IdentityPublic, &mut small), None);
    }

    #[test]
    fn test_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("zt-state-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let mut store = StateStore::new(dir.to_str().unwrap());
        let mut buf = [0u8; 64];

        assert_eq!(store.get(StateObject::IdentitySecret, &mut buf), None);

        store.put(StateObject::IdentitySecret, Some(b"key material"));
        assert!(dir.join("identity.secret").exists());
        assert_eq!(store.get(StateObject::IdentitySecret, &mut buf), Some(12));
        assert_eq!(&buf[..12], b"key material");

        store.put(StateObject::IdentitySecret, None);
        assert!(!dir.join("identity.secret").exists());

        fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_non_persisted_objects_are_ignored_on_disk() {
        let dir = std::env::temp_dir().join(format!("zt-state-{}", Uuid::new_v4()));
        fs::create_dir_all(&dir).unwrap();

        let mut store = StateStore::new(dir.to_str().unwrap());
        store.put(StateObject::Peer, Some(b"x"));
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 0);

        let mut buf = [0u8; 8];
        assert_eq!(store.get(StateObject::Peer, &mut buf), None);

        fs::remove_dir_all(&dir).unwrap();
    }
}

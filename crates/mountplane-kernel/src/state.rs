//! Shared mount state: one mount's configuration and status flags.
//!
//! [`SharedMountState`] is the value object every thread in a process reads.
//! The whole [`MountState`] sits behind a single `RwLock`, so a reader never
//! sees `connecting` cleared without `connected` set (or the reverse). No
//! operation fails and none performs I/O.

use std::path::{Path, PathBuf};

use parking_lot::RwLock;

use mountplane_types::{
    Credentials, MountConfig, MountDetails, MountId, MountPhase, normalize_mountpoint,
};

/// Plain-data view of a mount.
#[derive(Clone, Debug)]
pub struct MountState {
    pub id: MountId,
    pub mountpoint: PathBuf,
    pub label: String,
    /// Kept for the mount's lifetime so a reconnect from `Disconnected` works.
    pub credentials: Credentials,
    pub use_cache: bool,
    pub phase: MountPhase,
    pub icon: Option<PathBuf>,
    pub fingerprints: Vec<String>,
    /// Bumped on every connect attempt and every disconnect.
    pub epoch: u64,
}

impl MountState {
    pub fn new(config: MountConfig) -> Self {
        Self {
            id: MountId::new(),
            mountpoint: normalize_mountpoint(&config.mountpoint),
            label: config.label,
            credentials: config.credentials,
            use_cache: false,
            phase: MountPhase::Created,
            icon: None,
            fingerprints: Vec::new(),
            epoch: 0,
        }
    }

    pub fn details(&self) -> MountDetails {
        MountDetails {
            id: self.id,
            mountpoint: self.mountpoint.clone(),
            label: self.label.clone(),
            use_cache: self.use_cache,
            icon: self.icon.clone(),
            phase: self.phase,
        }
    }

    /// Rebuild the config a transport needs for a connect.
    pub fn config(&self) -> MountConfig {
        MountConfig {
            mountpoint: self.mountpoint.clone(),
            label: self.label.clone(),
            credentials: self.credentials.clone(),
        }
    }
}

/// Thread-safe holder for one [`MountState`].
#[derive(Debug)]
pub struct SharedMountState {
    inner: RwLock<MountState>,
}

impl SharedMountState {
    pub fn new(config: MountConfig) -> Self {
        Self {
            inner: RwLock::new(MountState::new(config)),
        }
    }

    /// Consistent copy of every field.
    pub fn snapshot(&self) -> MountState {
        self.inner.read().clone()
    }

    /// Apply a multi-field transition atomically.
    pub fn update<R>(&self, f: impl FnOnce(&mut MountState) -> R) -> R {
        f(&mut self.inner.write())
    }

    // ========================================================================
    // Getters
    // ========================================================================

    pub fn id(&self) -> MountId {
        self.inner.read().id
    }

    pub fn mountpoint(&self) -> PathBuf {
        self.inner.read().mountpoint.clone()
    }

    pub fn label(&self) -> String {
        self.inner.read().label.clone()
    }

    pub fn use_cache(&self) -> bool {
        self.inner.read().use_cache
    }

    pub fn phase(&self) -> MountPhase {
        self.inner.read().phase
    }

    pub fn connected(&self) -> bool {
        self.inner.read().phase.is_connected()
    }

    pub fn connecting(&self) -> bool {
        self.inner.read().phase.is_connecting()
    }

    pub fn icon(&self) -> Option<PathBuf> {
        self.inner.read().icon.clone()
    }

    pub fn fingerprints(&self) -> Vec<String> {
        self.inner.read().fingerprints.clone()
    }

    pub fn epoch(&self) -> u64 {
        self.inner.read().epoch
    }

    pub fn details(&self) -> MountDetails {
        self.inner.read().details()
    }

    // ========================================================================
    // Setters
    // ========================================================================

    pub fn set_mountpoint(&self, path: &Path) {
        self.inner.write().mountpoint = normalize_mountpoint(path);
    }

    pub fn set_use_cache(&self, enabled: bool) {
        self.inner.write().use_cache = enabled;
    }

    pub fn set_icon(&self, path: Option<PathBuf>) {
        self.inner.write().icon = path;
    }

    pub fn set_fingerprints(&self, fingerprints: Vec<String>) {
        self.inner.write().fingerprints = fingerprints;
    }

    pub fn set_phase(&self, phase: MountPhase) {
        self.inner.write().phase = phase;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use mountplane_types::Secret;

    use super::*;

    fn config() -> MountConfig {
        MountConfig::new(
            "/Volumes/Vault/",
            "Vault",
            Credentials::new("bob", Secret::new("pw"), "localhost", 2222),
        )
    }

    #[test]
    fn test_defaults_after_create() {
        let state = SharedMountState::new(config());
        assert_eq!(state.phase(), MountPhase::Created);
        assert!(!state.use_cache());
        assert!(!state.connected());
        assert!(!state.connecting());
        assert_eq!(state.mountpoint(), PathBuf::from("/Volumes/Vault"));
        assert_eq!(state.label(), "Vault");
        assert_eq!(state.epoch(), 0);
    }

    #[test]
    fn test_setters_visible_on_next_read() {
        let state = SharedMountState::new(config());
        state.set_use_cache(true);
        state.set_icon(Some(PathBuf::from("/tmp/icon.png")));
        state.set_mountpoint(Path::new("/Volumes/Other/"));
        state.set_fingerprints(vec!["SHA256:abc".into()]);

        let snap = state.snapshot();
        assert!(snap.use_cache);
        assert_eq!(snap.icon, Some(PathBuf::from("/tmp/icon.png")));
        assert_eq!(snap.mountpoint, PathBuf::from("/Volumes/Other"));
        assert_eq!(snap.fingerprints, vec!["SHA256:abc".to_string()]);
    }

    #[test]
    fn test_update_returns_value() {
        let state = SharedMountState::new(config());
        let epoch = state.update(|s| {
            s.phase = MountPhase::Connecting;
            s.epoch += 1;
            s.epoch
        });
        assert_eq!(epoch, 1);
        assert!(state.connecting());
    }

    #[test]
    fn test_readers_never_see_both_flags() {
        let state = Arc::new(SharedMountState::new(config()));
        let writer = {
            let state = state.clone();
            std::thread::spawn(move || {
                for i in 0..2000 {
                    let phase = if i % 2 == 0 {
                        MountPhase::Connecting
                    } else {
                        MountPhase::Connected
                    };
                    state.set_phase(phase);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..2000 {
                        let snap = state.snapshot();
                        assert!(!(snap.phase.is_connected() && snap.phase.is_connecting()));
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
    }
}

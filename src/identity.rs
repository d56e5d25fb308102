//! Create-once, persist-forever identity artifacts for an instance.
//!
//! Every artifact lives in its own file inside the instance directory.
//! Once a file exists it is the source of truth: it is decoded and returned
//! as-is and never regenerated. Regenerating the hardware model in
//! particular would orphan the auxiliary storage created against it and
//! leave the guest unbootable.

use std::fmt;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use rand_core::{OsRng, RngCore};

use crate::error::CanneryError;
use crate::paths;

/// A binary value persisted in a fixed file of the instance directory.
pub trait Artifact: Sized {
    const FILE_NAME: &'static str;
    /// Human-readable name for errors and logs.
    const DESCRIPTION: &'static str;

    fn encode(&self) -> Vec<u8>;
    fn decode(bytes: &[u8]) -> Result<Self, String>;
}

// ── Artifacts ───────────────────────────────────────────────────────

/// Opaque description of the virtual hardware generation, produced by the
/// hypervisor from the install image chosen at first provisioning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HardwareModel(Vec<u8>);

impl HardwareModel {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Artifact for HardwareModel {
    const FILE_NAME: &'static str = paths::HARDWARE_MODEL_FILE;
    const DESCRIPTION: &'static str = "hardware model";

    fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.is_empty() {
            return Err("file is empty".into());
        }
        Ok(Self(bytes.to_vec()))
    }
}

/// Token distinguishing this instance from every other one on the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineIdentifier([u8; 16]);

impl MachineIdentifier {
    pub fn random() -> Self {
        let mut bytes = [0u8; 16];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for MachineIdentifier {
    /// RFC 4122 textual form, used as the SMBIOS system UUID.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                f.write_str("-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl Artifact for MachineIdentifier {
    const FILE_NAME: &'static str = paths::MACHINE_IDENTIFIER_FILE;
    const DESCRIPTION: &'static str = "machine identifier";

    fn encode(&self) -> Vec<u8> {
        self.0.to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let array: [u8; 16] = bytes
            .try_into()
            .map_err(|_| format!("expected 16 bytes, found {}", bytes.len()))?;
        Ok(Self(array))
    }
}

/// Hardware address of the instance's virtual network adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Random locally administered unicast address.
    pub fn random() -> Self {
        let mut bytes = [0u8; 6];
        OsRng.fill_bytes(&mut bytes);
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        Self(bytes)
    }

    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.trim().split(':');
        for byte in &mut bytes {
            let part = parts
                .next()
                .ok_or_else(|| format!("'{s}' has fewer than 6 octets"))?;
            if part.len() != 2 {
                return Err(format!("'{s}' has a malformed octet '{part}'"));
            }
            *byte = u8::from_str_radix(part, 16)
                .map_err(|_| format!("'{s}' has a non-hex octet '{part}'"))?;
        }
        if parts.next().is_some() {
            return Err(format!("'{s}' has more than 6 octets"));
        }
        if bytes[0] & 0x01 != 0 {
            return Err(format!("'{s}' is a multicast address"));
        }
        Ok(Self(bytes))
    }
}

impl Artifact for MacAddress {
    const FILE_NAME: &'static str = paths::MAC_ADDRESS_FILE;
    const DESCRIPTION: &'static str = "network address";

    fn encode(&self) -> Vec<u8> {
        self.to_string().into_bytes()
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        let text = std::str::from_utf8(bytes).map_err(|_| "not valid UTF-8".to_string())?;
        text.parse()
    }
}

/// Boot variable store, bound at creation time to one hardware model.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuxiliaryStorage(Vec<u8>);

impl AuxiliaryStorage {
    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl Artifact for AuxiliaryStorage {
    const FILE_NAME: &'static str = paths::AUXILIARY_STORAGE_FILE;
    const DESCRIPTION: &'static str = "auxiliary storage";

    fn encode(&self) -> Vec<u8> {
        self.0.clone()
    }

    fn decode(bytes: &[u8]) -> Result<Self, String> {
        if bytes.is_empty() {
            return Err("file is empty".into());
        }
        Ok(Self(bytes.to_vec()))
    }
}

// ── Store ───────────────────────────────────────────────────────────

/// Identity artifacts of one instance directory.
#[derive(Debug, Clone)]
pub struct IdentityStore {
    dir: PathBuf,
}

impl IdentityStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path<T: Artifact>(&self) -> PathBuf {
        self.dir.join(T::FILE_NAME)
    }

    pub fn exists<T: Artifact>(&self) -> bool {
        self.path::<T>().is_file()
    }

    /// Decode the artifact if its file exists.
    pub fn load<T: Artifact>(&self) -> Result<Option<T>, CanneryError> {
        let path = self.path::<T>();
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(CanneryError::io(
                    format!("reading {} from {}", T::DESCRIPTION, path.display()),
                    e,
                ));
            }
        };

        T::decode(&bytes)
            .map(Some)
            .map_err(|message| CanneryError::Corrupt {
                artifact: T::DESCRIPTION,
                path: path.display().to_string(),
                message,
            })
    }

    /// Return the persisted artifact, or generate, persist and return a new one.
    ///
    /// The generator only runs when no file exists.
    pub fn load_or_create<T, F>(&self, generate: F) -> Result<T, CanneryError>
    where
        T: Artifact,
        F: FnOnce() -> Result<T, CanneryError>,
    {
        if let Some(existing) = self.load::<T>()? {
            return Ok(existing);
        }

        let value = generate()?;
        self.persist(&value)?;
        tracing::info!(
            artifact = T::DESCRIPTION,
            path = %self.path::<T>().display(),
            "created identity artifact"
        );
        Ok(value)
    }

    /// Persist a freshly committed artifact. Refuses to replace one that
    /// already exists.
    pub fn create<T: Artifact>(&self, value: &T) -> Result<(), CanneryError> {
        let path = self.path::<T>();
        if path.exists() {
            return Err(CanneryError::io(
                format!("refusing to replace {} at {}", T::DESCRIPTION, path.display()),
                std::io::Error::from(std::io::ErrorKind::AlreadyExists),
            ));
        }
        self.persist(value)?;
        tracing::info!(artifact = T::DESCRIPTION, path = %path.display(), "committed identity artifact");
        Ok(())
    }

    fn persist<T: Artifact>(&self, value: &T) -> Result<(), CanneryError> {
        let path = self.path::<T>();
        write_durably(&path, &value.encode()).map_err(|e| {
            CanneryError::io(
                format!("writing {} to {}", T::DESCRIPTION, path.display()),
                e,
            )
        })
    }
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`,
/// so readers see either nothing or the complete content.
pub(crate) fn write_durably(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let tmp = path.with_file_name(format!(".{file_name}.tmp"));

    let result = (|| {
        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        std::fs::rename(&tmp, path)
    })();

    if result.is_err() {
        let _ = std::fs::remove_file(&tmp);
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_artifact_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        assert!(store.load::<MachineIdentifier>().unwrap().is_none());
        assert!(!store.exists::<HardwareModel>());
    }

    #[test]
    fn load_or_create_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());

        let first = store
            .load_or_create(|| Ok(MachineIdentifier::random()))
            .unwrap();
        let second = store
            .load_or_create(|| Ok(MachineIdentifier::random()))
            .unwrap();
        assert_eq!(first, second);

        let mac1 = store.load_or_create(|| Ok(MacAddress::random())).unwrap();
        let mac2 = store.load_or_create(|| Ok(MacAddress::random())).unwrap();
        assert_eq!(mac1, mac2);
        assert_eq!(
            std::fs::read(store.path::<MacAddress>()).unwrap(),
            mac1.to_string().into_bytes()
        );
    }

    #[test]
    fn generator_not_called_when_present() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store
            .load_or_create(|| Ok(HardwareModel::from_bytes(b"model-a".to_vec())))
            .unwrap();

        let model = store
            .load_or_create::<HardwareModel, _>(|| panic!("must not regenerate"))
            .unwrap();
        assert_eq!(model.as_bytes(), b"model-a");
    }

    #[test]
    fn generator_error_persists_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        let result = store.load_or_create::<AuxiliaryStorage, _>(|| {
            Err(CanneryError::Hypervisor {
                message: "no template".into(),
            })
        });
        assert!(result.is_err());
        assert!(!store.exists::<AuxiliaryStorage>());
    }

    #[test]
    fn create_refuses_to_replace() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        store
            .create(&HardwareModel::from_bytes(b"first".to_vec()))
            .unwrap();
        assert!(
            store
                .create(&HardwareModel::from_bytes(b"second".to_vec()))
                .is_err()
        );
        let model = store.load::<HardwareModel>().unwrap().unwrap();
        assert_eq!(model.as_bytes(), b"first");
    }

    #[test]
    fn truncated_machine_identifier_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        std::fs::write(store.path::<MachineIdentifier>(), [1, 2, 3]).unwrap();

        let err = store.load::<MachineIdentifier>().unwrap_err();
        assert!(matches!(err, CanneryError::Corrupt { .. }));
        // A corrupt artifact is never silently replaced.
        assert!(
            store
                .load_or_create(|| Ok(MachineIdentifier::random()))
                .is_err()
        );
    }

    #[test]
    fn malformed_mac_address_fails_fast() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        std::fs::write(store.path::<MacAddress>(), "not-a-mac").unwrap();
        assert!(matches!(
            store.load::<MacAddress>(),
            Err(CanneryError::Corrupt { .. })
        ));
    }

    #[test]
    fn empty_hardware_model_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let store = IdentityStore::new(dir.path());
        std::fs::write(store.path::<HardwareModel>(), b"").unwrap();
        assert!(matches!(
            store.load::<HardwareModel>(),
            Err(CanneryError::Corrupt { .. })
        ));
    }

    #[test]
    fn random_mac_is_local_unicast() {
        for _ in 0..32 {
            let mac = MacAddress::random();
            let first = mac.octets()[0];
            assert_eq!(first & 0x01, 0, "multicast bit set in {mac}");
            assert_eq!(first & 0x02, 0x02, "local bit clear in {mac}");
            assert_eq!(mac.to_string().parse::<MacAddress>().unwrap(), mac);
        }
    }

    #[test]
    fn mac_parse_rejects_bad_shapes() {
        for bad in [
            "",
            "02:00:00:00:00",
            "02:00:00:00:00:00:00",
            "02:00:00:00:00:zz",
            "2:00:00:00:00:00",
            "01:00:5e:00:00:01",
        ] {
            assert!(bad.parse::<MacAddress>().is_err(), "accepted '{bad}'");
        }
    }

    #[test]
    fn machine_identifier_displays_as_uuid() {
        let id = MachineIdentifier::decode(&[0xab; 16]).unwrap();
        assert_eq!(id.to_string(), "abababab-abab-abab-abab-abababababab");
    }

    #[test]
    fn write_durably_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("macid.bin");
        write_durably(&path, b"abc").unwrap();
        let names: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("macid.bin")]);
    }
}

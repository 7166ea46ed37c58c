/// Serde helpers for fields carried as base64 strings in configuration and
/// fixture files (key material, device identifiers).
pub mod base64 {
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub use base64::{decode, encode};

    pub fn serialize<S: Serializer>(bytes: impl AsRef<[u8]>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&encode(bytes.as_ref()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        decode(&raw).map_err(de::Error::custom)
    }
}

//! Value codecs
//!
//! Values are encoded with serde into one of a small set of formats, chosen
//! explicitly by tag or inferred from the object's extension.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{Error, Result};

/// Supported value encodings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileFormat {
    /// UTF-8 JSON (`.json`)
    Json,
    /// MessagePack with named fields (`.pkl`, `.msgpack`, `.mpk`)
    MessagePack,
}

impl FileFormat {
    /// Infer the format from a path's extension
    pub fn infer(path: &str) -> Result<Self> {
        let extension = path
            .rsplit('/')
            .next()
            .and_then(|name| name.rsplit_once('.'))
            .map(|(_, ext)| ext)
            .unwrap_or("");
        extension.parse().map_err(|_| {
            Error::Configuration(format!(
                "cannot infer value format from extension '{}' of '{}'",
                extension, path
            ))
        })
    }

    /// Encode a value
    pub fn encode<T: Serialize + ?Sized>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            FileFormat::Json => {
                serde_json::to_vec(value).map_err(|e| Error::Codec(e.to_string()))
            }
            FileFormat::MessagePack => {
                rmp_serde::to_vec_named(value).map_err(|e| Error::Codec(e.to_string()))
            }
        }
    }

    /// Decode a value
    pub fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            FileFormat::Json => {
                serde_json::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
            }
            FileFormat::MessagePack => {
                rmp_serde::from_slice(bytes).map_err(|e| Error::Codec(e.to_string()))
            }
        }
    }
}

impl FromStr for FileFormat {
    type Err = Error;

    fn from_str(tag: &str) -> Result<Self> {
        match tag.to_ascii_lowercase().as_str() {
            "json" => Ok(FileFormat::Json),
            "pkl" | "msgpack" | "mpk" => Ok(FileFormat::MessagePack),
            other => Err(Error::Configuration(format!(
                "file format '{}' not supported",
                other
            ))),
        }
    }
}

impl fmt::Display for FileFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileFormat::Json => write!(f, "json"),
            FileFormat::MessagePack => write!(f, "msgpack"),
        }
    }
}

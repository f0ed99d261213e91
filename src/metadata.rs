use serde::Serialize;

use crate::codec::BloscCompressionParams;
use crate::config::ArrayConfig;
use crate::frame::SampleType;

pub const CORE_PROTOCOL_URL: &str = "https://purl.org/zarr/spec/protocol/core/3.0";
pub const BLOSC_CODEC_URL: &str = "https://purl.org/zarr/spec/codec/blosc/1.0";
pub const SHARDING_EXTENSION_URL: &str =
    "https://purl.org/zarr/spec/storage_transformers/sharding/1.0";

// Fields are declared in lexicographic order so documents serialize with sorted keys.

/// Entry point document, `zarr.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BaseMetadata {
    pub extensions: Vec<serde_json::Value>,
    pub metadata_encoding: String,
    pub metadata_key_suffix: String,
    pub zarr_format: String,
}

impl Default for BaseMetadata {
    fn default() -> Self {
        Self {
            extensions: Vec::new(),
            metadata_encoding: CORE_PROTOCOL_URL.to_string(),
            metadata_key_suffix: ".json".to_string(),
            zarr_format: CORE_PROTOCOL_URL.to_string(),
        }
    }
}

/// Root group document, `meta/root.group.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupMetadata {
    pub attributes: GroupAttributes,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupAttributes {
    /// Parsed external metadata, or an empty string if none was supplied.
    pub acquire: serde_json::Value,
}

impl GroupMetadata {
    /// Build the group document from external metadata text.
    pub fn new(external_metadata: &str) -> crate::Result<Self> {
        Ok(Self {
            attributes: GroupAttributes {
                acquire: parse_external_metadata(external_metadata)?,
            },
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkGrid {
    pub chunk_shape: Vec<u64>,
    pub separator: String,
    #[serde(rename = "type")]
    pub grid_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BloscConfiguration {
    pub blocksize: u64,
    pub clevel: u8,
    pub cname: String,
    pub shuffle: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Compressor {
    pub codec: String,
    pub configuration: BloscConfiguration,
}

impl From<&BloscCompressionParams> for Compressor {
    fn from(params: &BloscCompressionParams) -> Self {
        Self {
            codec: BLOSC_CODEC_URL.to_string(),
            configuration: BloscConfiguration {
                blocksize: 0,
                clevel: params.clevel,
                cname: params.codec_id.clone(),
                shuffle: params.shuffle,
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ShardingConfiguration {
    pub chunks_per_shard: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StorageTransformer {
    pub configuration: ShardingConfiguration,
    pub extension: String,
    #[serde(rename = "type")]
    pub transformer_type: String,
}

/// Per-level array document, `meta/root/<level>.array.json`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArrayMetadata {
    pub attributes: serde_json::Map<String, serde_json::Value>,
    pub chunk_grid: ChunkGrid,
    pub chunk_memory_layout: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressor: Option<Compressor>,
    pub data_type: String,
    pub extensions: Vec<serde_json::Value>,
    pub fill_value: u8,
    pub shape: Vec<u64>,
    pub storage_transformers: Vec<StorageTransformer>,
}

impl ArrayMetadata {
    /// Describe an array after `frames_written` frames were accepted.
    ///
    /// The leading shape entry counts the append positions touched; the rest
    /// are the configured extents, outermost first.
    pub fn new(config: &ArrayConfig, frames_written: u64) -> Self {
        let appended = frames_written.div_ceil(config.frames_per_append_position());
        let shape = std::iter::once(appended)
            .chain(
                config.dimensions[1..]
                    .iter()
                    .map(|d| u64::from(d.array_size_px)),
            )
            .collect();
        let chunk_shape = config
            .dimensions
            .iter()
            .map(|d| u64::from(d.chunk_size_px))
            .collect();
        let chunks_per_shard = config
            .dimensions
            .iter()
            .map(|d| u64::from(d.shard_size_chunks))
            .collect();

        Self {
            attributes: serde_json::Map::new(),
            chunk_grid: ChunkGrid {
                chunk_shape,
                separator: "/".to_string(),
                grid_type: "regular".to_string(),
            },
            chunk_memory_layout: "C".to_string(),
            compressor: config.compression_params.as_ref().map(Compressor::from),
            data_type: sample_type_to_dtype(config.image_shape.sample_type).to_string(),
            extensions: Vec::new(),
            fill_value: 0,
            shape,
            storage_transformers: vec![StorageTransformer {
                configuration: ShardingConfiguration { chunks_per_shard },
                extension: SHARDING_EXTENSION_URL.to_string(),
                transformer_type: "indexed".to_string(),
            }],
        }
    }
}

pub fn sample_type_to_dtype(sample_type: SampleType) -> &'static str {
    match sample_type {
        SampleType::U8 => "uint8",
        SampleType::I8 => "int8",
        SampleType::I16 => "int16",
        SampleType::F32 => "float32",
        SampleType::U16 | SampleType::U10 | SampleType::U12 | SampleType::U14 => "uint16",
    }
}

/// Pretty-print with four-space indentation.
pub fn to_json_bytes<T: Serialize>(value: &T) -> crate::Result<Vec<u8>> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// Parse external metadata, allowing `//` and `/* */` comments.
///
/// Empty text means "none supplied" and becomes an empty string value.
pub fn parse_external_metadata(text: &str) -> crate::Result<serde_json::Value> {
    if text.is_empty() {
        return Ok(serde_json::Value::String(String::new()));
    }
    let stripped = strip_comments(text)?;
    serde_json::from_str(&stripped).map_err(|e| crate::Error::ExternalMetadata(e.to_string()))
}

/// Blank out comments, keeping line structure so parse errors point at the right place.
fn strip_comments(text: &str) -> crate::Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    let mut in_string = false;

    while let Some(c) = chars.next() {
        if in_string {
            out.push(c);
            match c {
                '\\' => {
                    if let Some(escaped) = chars.next() {
                        out.push(escaped);
                    }
                }
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match (c, chars.peek()) {
            ('"', _) => {
                in_string = true;
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                let mut closed = false;
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && next == '/' {
                        closed = true;
                        break;
                    }
                    prev = next;
                }
                if !closed {
                    return Err(crate::Error::ExternalMetadata(
                        "unterminated block comment".to_string(),
                    ));
                }
                out.push(' ');
            }
            _ => out.push(c),
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use serde_json::json;

    use super::*;
    use crate::config::Dimension;
    use crate::frame::ImageShape;

    fn config(compression_params: Option<BloscCompressionParams>) -> ArrayConfig {
        ArrayConfig {
            image_shape: ImageShape::new(64, 48, SampleType::U16),
            dimensions: vec![
                Dimension::new("t", 0, 5, 2),
                Dimension::new("c", 3, 1, 1),
                Dimension::new("y", 48, 16, 3),
                Dimension::new("x", 64, 16, 2),
            ],
            data_root: PathBuf::from("data/root/0"),
            compression_params,
        }
    }

    #[test]
    fn base_document() {
        let bytes = to_json_bytes(&BaseMetadata::default()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(
            value,
            json!({
                "extensions": [],
                "metadata_encoding": "https://purl.org/zarr/spec/protocol/core/3.0",
                "metadata_key_suffix": ".json",
                "zarr_format": "https://purl.org/zarr/spec/protocol/core/3.0"
            })
        );
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("{\n    \"extensions\": []"));
    }

    #[test]
    fn array_document_with_compressor() {
        let meta = ArrayMetadata::new(&config(Some(BloscCompressionParams::zstd())), 7);
        let value = serde_json::to_value(&meta).unwrap();
        assert_eq!(value["shape"], json!([3, 3, 48, 64]));
        assert_eq!(value["chunk_grid"]["chunk_shape"], json!([5, 1, 16, 16]));
        assert_eq!(value["chunk_grid"]["type"], "regular");
        assert_eq!(value["data_type"], "uint16");
        assert_eq!(value["fill_value"], 0);
        assert_eq!(
            value["compressor"],
            json!({
                "codec": "https://purl.org/zarr/spec/codec/blosc/1.0",
                "configuration": {"blocksize": 0, "clevel": 1, "cname": "zstd", "shuffle": 1}
            })
        );
        assert_eq!(
            value["storage_transformers"][0]["configuration"]["chunks_per_shard"],
            json!([2, 1, 3, 2])
        );
        assert_eq!(value["storage_transformers"][0]["type"], "indexed");
    }

    #[test]
    fn array_document_without_compressor() {
        let meta = ArrayMetadata::new(&config(None), 0);
        let value = serde_json::to_value(&meta).unwrap();
        assert!(value.get("compressor").is_none());
        assert!(value.get("storage_transformers").is_some());
        assert_eq!(value["shape"][0], 0);
    }

    #[test]
    fn empty_external_metadata_is_empty_string() {
        let group = GroupMetadata::new("").unwrap();
        let value = serde_json::to_value(&group).unwrap();
        assert_eq!(value, json!({"attributes": {"acquire": ""}}));
    }

    #[test]
    fn external_metadata_allows_comments() {
        let text = r#"{
            // who
            "operator": "a // not a comment",
            /* multi
               line */
            "exposure_ms": 10
        }"#;
        let value = parse_external_metadata(text).unwrap();
        assert_eq!(
            value,
            json!({"operator": "a // not a comment", "exposure_ms": 10})
        );
    }

    #[test]
    fn malformed_external_metadata_is_an_error() {
        assert!(matches!(
            GroupMetadata::new("{not json"),
            Err(crate::Error::ExternalMetadata(_))
        ));
        assert!(matches!(
            parse_external_metadata("{} /* open"),
            Err(crate::Error::ExternalMetadata(_))
        ));
    }
}

use anyhow::{bail, Result};
use serde_json::{json, Value};

/// Decoded form of a `data:<mime>;base64,<payload>` URL.
///
/// The payload is kept base64-encoded; the wire format wants it that way and
/// decoding it here would only round-trip the bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataUrl {
    pub mime: String,
    pub data: String,
}

impl DataUrl {
    pub fn parse(raw: &str) -> Result<Self> {
        let Some((header, payload)) = raw.split_once(',') else {
            bail!("data URL has no payload separator");
        };
        let Some(rest) = header.strip_prefix("data:") else {
            bail!("data URL missing 'data:' scheme");
        };
        let mime = rest.split(';').next().unwrap_or_default().trim();
        if mime.is_empty() {
            bail!("data URL has an empty MIME type");
        }
        if payload.is_empty() {
            bail!("data URL has an empty payload");
        }
        Ok(Self {
            mime: mime.to_string(),
            data: payload.to_string(),
        })
    }

    pub fn encode(mime: &str, base64_payload: &str) -> String {
        format!("data:{mime};base64,{base64_payload}")
    }
}

/// One unit of a generation request: inline image bytes or prompt text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Part {
    InlineImage { mime: String, data: String },
    Text(String),
}

impl Part {
    pub fn from_data_url(raw: &str) -> Result<Self> {
        let parsed = DataUrl::parse(raw)?;
        Ok(Self::InlineImage {
            mime: parsed.mime,
            data: parsed.data,
        })
    }

    pub fn to_wire(&self) -> Value {
        match self {
            Self::InlineImage { mime, data } => json!({
                "inlineData": {
                    "mimeType": mime,
                    "data": data,
                }
            }),
            Self::Text(text) => json!({ "text": text }),
        }
    }
}

/// Orders request parts the way the remote model expects them: the main image
/// (if any) ahead of the prompt text, reference images after it in their
/// original order.
pub fn assemble_parts(
    prompt: &str,
    main_image: Option<&str>,
    reference_images: &[String],
) -> Result<Vec<Part>> {
    let mut parts = Vec::with_capacity(2 + reference_images.len());
    if let Some(image) = main_image {
        parts.push(Part::from_data_url(image)?);
    }
    parts.push(Part::Text(prompt.to_string()));
    for reference in reference_images {
        parts.push(Part::from_data_url(reference)?);
    }
    Ok(parts)
}

pub fn parts_to_wire(parts: &[Part]) -> Vec<Value> {
    parts.iter().map(Part::to_wire).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_extracts_mime_and_payload() -> Result<()> {
        let parsed = DataUrl::parse("data:image/png;base64,AAAA")?;
        assert_eq!(parsed.mime, "image/png");
        assert_eq!(parsed.data, "AAAA");
        Ok(())
    }

    #[test]
    fn parse_tolerates_extra_header_parameters() -> Result<()> {
        let parsed = DataUrl::parse("data:image/jpeg;charset=utf-8;base64,QUJD")?;
        assert_eq!(parsed.mime, "image/jpeg");
        assert_eq!(parsed.data, "QUJD");
        Ok(())
    }

    #[test]
    fn parse_rejects_malformed_headers() {
        assert!(DataUrl::parse("image/png;base64,AAAA").is_err());
        assert!(DataUrl::parse("data:;base64,AAAA").is_err());
        assert!(DataUrl::parse("data:image/png;base64").is_err());
        assert!(DataUrl::parse("data:image/png;base64,").is_err());
    }

    #[test]
    fn encode_round_trips_through_parse() -> Result<()> {
        let url = DataUrl::encode("image/png", "Zm9v");
        let parsed = DataUrl::parse(&url)?;
        assert_eq!(parsed.mime, "image/png");
        assert_eq!(parsed.data, "Zm9v");
        Ok(())
    }

    #[test]
    fn assembly_orders_main_prompt_then_references() -> Result<()> {
        let references = vec![
            DataUrl::encode("image/jpeg", "UkVGMQ"),
            DataUrl::encode("image/webp", "UkVGMg"),
        ];
        let main = DataUrl::encode("image/png", "TUFJTg");
        let parts = assemble_parts("restore this photo", Some(&main), &references)?;

        assert_eq!(parts.len(), 4);
        assert_eq!(
            parts[0],
            Part::InlineImage {
                mime: "image/png".to_string(),
                data: "TUFJTg".to_string(),
            }
        );
        assert_eq!(parts[1], Part::Text("restore this photo".to_string()));
        assert_eq!(
            parts[2],
            Part::InlineImage {
                mime: "image/jpeg".to_string(),
                data: "UkVGMQ".to_string(),
            }
        );
        assert_eq!(
            parts[3],
            Part::InlineImage {
                mime: "image/webp".to_string(),
                data: "UkVGMg".to_string(),
            }
        );
        Ok(())
    }

    #[test]
    fn assembly_without_images_is_text_only() -> Result<()> {
        let parts = assemble_parts("a studio backdrop", None, &[])?;
        assert_eq!(parts, vec![Part::Text("a studio backdrop".to_string())]);
        Ok(())
    }

    #[test]
    fn wire_shape_matches_inline_data_contract() -> Result<()> {
        let part = Part::from_data_url("data:image/png;base64,AAAA")?;
        assert_eq!(
            part.to_wire(),
            json!({
                "inlineData": {
                    "mimeType": "image/png",
                    "data": "AAAA",
                }
            })
        );
        assert_eq!(
            Part::Text("hello".to_string()).to_wire(),
            json!({ "text": "hello" })
        );
        Ok(())
    }
}

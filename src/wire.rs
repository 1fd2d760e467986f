//! Decoding of job output frames.
//!
//! Every binary frame on a job socket is one BSON document of one of two
//! shapes:
//!
//! ```text
//! { "data": [ { "entry": { "payload": <binary> } }, ... ] }   inline output
//! { "urls": [ "https://...", ... ] }                          fetch out-of-band
//! ```
//!
//! `payload` may be absent (keep-alive entries). Documents carrying neither
//! key are ignored; anything else that does not fit the shapes above is a
//! [`DecodeError`].

use bson::{Bson, Document};

/// One decoded unit of job output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Envelope {
    /// Inline output entries, in the order they must be rendered.
    Data(Vec<Entry>),
    /// URLs whose bodies must be streamed to the output in order.
    Urls(Vec<String>),
}

/// A single output entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub payload: Option<Vec<u8>>,
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid BSON frame: {0}")]
    Bson(#[from] bson::de::Error),
    #[error("unexpected frame layout: {0}")]
    Layout(String),
}

/// Decode one frame. Returns `Ok(None)` for documents with neither `data`
/// nor `urls`.
pub fn decode(frame: &[u8]) -> Result<Option<Envelope>, DecodeError> {
    let doc: Document = bson::from_slice(frame)?;

    if let Some(data) = doc.get("data") {
        return decode_data(data).map(|entries| Some(Envelope::Data(entries)));
    }
    if let Some(urls) = doc.get("urls") {
        return decode_urls(urls).map(|urls| Some(Envelope::Urls(urls)));
    }
    Ok(None)
}

fn decode_data(data: &Bson) -> Result<Vec<Entry>, DecodeError> {
    let Bson::Array(items) = data else {
        return Err(layout(format!("`data` is {:?}, expected array", data.element_type())));
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| {
            let entry = item
                .as_document()
                .and_then(|d| d.get_document("entry").ok())
                .ok_or_else(|| layout(format!("data[{i}] has no `entry` document")))?;
            let payload = match entry.get("payload") {
                None | Some(Bson::Null) => None,
                Some(Bson::Binary(bin)) => Some(bin.bytes.clone()),
                Some(Bson::String(text)) => Some(text.clone().into_bytes()),
                Some(other) => {
                    return Err(layout(format!(
                        "data[{i}].entry.payload is {:?}",
                        other.element_type()
                    )))
                }
            };
            Ok(Entry { payload })
        })
        .collect()
}

fn decode_urls(urls: &Bson) -> Result<Vec<String>, DecodeError> {
    let Bson::Array(items) = urls else {
        return Err(layout(format!("`urls` is {:?}, expected array", urls.element_type())));
    };

    items
        .iter()
        .enumerate()
        .map(|(i, item)| match item {
            Bson::String(url) => Ok(url.clone()),
            other => Err(layout(format!("urls[{i}] is {:?}", other.element_type()))),
        })
        .collect()
}

fn layout(detail: String) -> DecodeError {
    DecodeError::Layout(detail)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::spec::BinarySubtype;
    use bson::{doc, Binary};

    fn bin(bytes: &[u8]) -> Binary {
        Binary {
            subtype: BinarySubtype::Generic,
            bytes: bytes.to_vec(),
        }
    }

    fn encode(doc: &Document) -> Vec<u8> {
        bson::to_vec(doc).unwrap()
    }

    #[test]
    fn decodes_data_entries_in_order() {
        let frame = encode(&doc! {
            "data": [
                { "entry": { "payload": bin(b"foo") } },
                { "entry": {} },
                { "entry": { "payload": bin(b"baz\n") } },
            ]
        });
        let envelope = decode(&frame).unwrap().unwrap();
        assert_eq!(
            envelope,
            Envelope::Data(vec![
                Entry { payload: Some(b"foo".to_vec()) },
                Entry { payload: None },
                Entry { payload: Some(b"baz\n".to_vec()) },
            ])
        );
    }

    #[test]
    fn string_payload_is_accepted() {
        let frame = encode(&doc! { "data": [ { "entry": { "payload": "hi" } } ] });
        let Some(Envelope::Data(entries)) = decode(&frame).unwrap() else {
            panic!("expected data envelope");
        };
        assert_eq!(entries[0].payload.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn decodes_urls() {
        let frame = encode(&doc! { "urls": ["https://a.example/1", "https://a.example/2"] });
        assert_eq!(
            decode(&frame).unwrap(),
            Some(Envelope::Urls(vec![
                "https://a.example/1".to_string(),
                "https://a.example/2".to_string(),
            ]))
        );
    }

    #[test]
    fn data_wins_over_urls() {
        let frame = encode(&doc! {
            "urls": ["https://a.example/1"],
            "data": [ { "entry": { "payload": bin(b"x") } } ],
        });
        assert!(matches!(decode(&frame).unwrap(), Some(Envelope::Data(_))));
    }

    #[test]
    fn unknown_document_is_ignored() {
        let frame = encode(&doc! { "status": "running" });
        assert_eq!(decode(&frame).unwrap(), None);
    }

    #[test]
    fn garbage_is_a_decode_error() {
        assert!(matches!(
            decode(b"not bson at all"),
            Err(DecodeError::Bson(_))
        ));
    }

    #[test]
    fn wrong_shapes_are_layout_errors() {
        let not_array = encode(&doc! { "data": "oops" });
        assert!(matches!(decode(&not_array), Err(DecodeError::Layout(_))));

        let no_entry = encode(&doc! { "data": [ { "payload": bin(b"x") } ] });
        assert!(matches!(decode(&no_entry), Err(DecodeError::Layout(_))));

        let bad_payload = encode(&doc! { "data": [ { "entry": { "payload": 42 } } ] });
        assert!(matches!(decode(&bad_payload), Err(DecodeError::Layout(_))));

        let bad_url = encode(&doc! { "urls": [ 1 ] });
        assert!(matches!(decode(&bad_url), Err(DecodeError::Layout(_))));
    }
}

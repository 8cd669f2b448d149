//! Cookie and body-content decoding applied after framing completes.

use std::collections::BTreeMap;
use std::io::Write;

use memchr::memmem;
use tempfile::NamedTempFile;

use super::query::{self, QueryMap};
use super::ParseError;
use crate::headers::HeaderMap;

/// Structured view of the request body, resolved from `Content-Type`.
#[derive(Debug)]
pub enum Content {
    /// Body absent or media type unrecognized; raw bytes remain available on
    /// the request record.
    None,
    /// `application/x-www-form-urlencoded` fields.
    Form(QueryMap),
    /// `application/json`. Malformed JSON is not an error here; the body
    /// is simply left unparsed.
    Json(serde_json::Value),
    /// `multipart/form-data` fields and uploaded files.
    Multipart(MultipartForm),
}

/// Decoded `multipart/form-data` payload.
#[derive(Debug, Default)]
pub struct MultipartForm {
    /// Plain fields by name. A repeated name keeps the last part.
    pub fields: BTreeMap<String, String>,
    /// File parts by field name, spilled to temporary backing files.
    pub files: BTreeMap<String, UploadedFile>,
}

/// A single uploaded file, written to a temporary backing file.
#[derive(Debug)]
pub struct UploadedFile {
    /// Client-supplied file name.
    pub filename: String,
    /// The part's own `Content-Type`, when present.
    pub content_type: Option<String>,
    /// Size of the uploaded content in bytes.
    pub size: u64,
    /// Temporary file holding the content; removed on drop.
    pub file: NamedTempFile,
}

/// Gathers cookies across every `Cookie` header: values split on `;`, each
/// piece split on the first `=`, values percent-decoded.
pub fn parse_cookies(headers: &HeaderMap) -> BTreeMap<String, String> {
    let mut cookies = BTreeMap::new();

    for value in headers.get_all("Cookie") {
        for piece in value.split(';') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }

            let (name, value) = piece.split_once('=').unwrap_or((piece, ""));
            cookies.insert(name.trim().to_string(), query::decode(value));
        }
    }

    cookies
}

/// Decodes the body according to `Content-Type`. Only a multipart payload
/// can fail here; every other shape degrades to [`Content::None`].
pub fn parse(headers: &HeaderMap, body: &[u8]) -> Result<Content, ParseError> {
    if body.is_empty() {
        return Ok(Content::None);
    }

    let Some(content_type) = headers.get("Content-Type") else {
        return Ok(Content::None);
    };

    let (mime, params) = match content_type.split_once(';') {
        Some((mime, params)) => (mime, params),
        None => (content_type, ""),
    };

    match mime.trim().to_ascii_lowercase().as_str() {
        "application/x-www-form-urlencoded" => {
            Ok(Content::Form(query::parse(&String::from_utf8_lossy(body))))
        }
        "application/json" => match serde_json::from_slice(body) {
            Ok(value) => Ok(Content::Json(value)),
            Err(_) => Ok(Content::None),
        },
        "multipart/form-data" => {
            let boundary = boundary_param(params).ok_or(ParseError::Boundary)?;
            if !valid_boundary(&boundary) {
                return Err(ParseError::Boundary);
            }
            Ok(Content::Multipart(parse_multipart(&boundary, body)?))
        }
        _ => Ok(Content::None),
    }
}

fn boundary_param(params: &str) -> Option<String> {
    for piece in params.split(';') {
        let piece = piece.trim();
        if let Some(value) = piece.strip_prefix("boundary=") {
            let value = value.trim_matches('"');
            return Some(value.to_string());
        }
    }
    None
}

/// RFC 2046 5.1.1: 1 to 70 characters from the `bchars` set, not ending in
/// a space.
fn valid_boundary(boundary: &str) -> bool {
    const EXTRA: &str = "'()+_,-./:=? ";

    !boundary.is_empty()
        && boundary.len() <= 70
        && !boundary.ends_with(' ')
        && boundary
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || EXTRA.contains(c))
}

/// Splits the body on `--<boundary>`; the first piece (preamble) and last
/// piece (closing marker and epilogue) are discarded, every piece between
/// is reparsed as headers + content.
fn parse_multipart(boundary: &str, body: &[u8]) -> Result<MultipartForm, ParseError> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();

    let mut positions: Vec<usize> = memmem::find_iter(body, delimiter).collect();
    if positions.len() < 2 {
        return Err(ParseError::Multipart);
    }
    positions.push(body.len());

    let mut form = MultipartForm::default();

    // windows over consecutive delimiters; skip the epilogue past the last one
    for pair in positions.windows(2).take(positions.len() - 2) {
        let piece = &body[pair[0] + delimiter.len()..pair[1]];
        let piece = piece.strip_prefix(b"\r\n").ok_or(ParseError::Multipart)?;
        let piece = piece.strip_suffix(b"\r\n").unwrap_or(piece);

        parse_part(piece, &mut form)?;
    }

    Ok(form)
}

fn parse_part(piece: &[u8], form: &mut MultipartForm) -> Result<(), ParseError> {
    let split = memmem::find(piece, b"\r\n\r\n").ok_or(ParseError::Multipart)?;
    let (header_block, content) = (&piece[..split], &piece[split + 4..]);

    let mut headers = HeaderMap::new();
    for line in header_block.split(|&b| b == b'\r') {
        let line = line.strip_prefix(b"\n").unwrap_or(line);
        if line.is_empty() {
            continue;
        }
        let text = String::from_utf8_lossy(line);
        let (name, value) = text.split_once(':').ok_or(ParseError::Multipart)?;
        headers.append(name.trim(), value.trim().to_string());
    }

    let disposition = headers
        .get("Content-Disposition")
        .ok_or(ParseError::Multipart)?;
    let Some(name) = disposition_param(disposition, "name") else {
        // unnamed parts carry nothing addressable
        return Ok(());
    };

    match disposition_param(disposition, "filename") {
        Some(filename) => {
            let mut file = NamedTempFile::new().map_err(|_| ParseError::Upload)?;
            file.write_all(content).map_err(|_| ParseError::Upload)?;
            file.flush().map_err(|_| ParseError::Upload)?;

            form.files.insert(
                name,
                UploadedFile {
                    filename,
                    content_type: headers.get("Content-Type").map(str::to_string),
                    size: content.len() as u64,
                    file,
                },
            );
        }
        None => {
            form.fields
                .insert(name, String::from_utf8_lossy(content).into_owned());
        }
    }

    Ok(())
}

fn disposition_param(disposition: &str, key: &str) -> Option<String> {
    for piece in disposition.split(';') {
        let piece = piece.trim();
        if let Some(value) = piece.strip_prefix(key) {
            if let Some(value) = value.strip_prefix('=') {
                return Some(value.trim_matches('"').to_string());
            }
        }
    }
    None
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::h1::query::Value;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in pairs {
            map.append(name, value.to_string());
        }
        map
    }

    #[test]
    fn cookies_concatenate_across_headers() {
        let map = headers(&[("Cookie", "s=1"), ("Cookie", "u=x")]);
        let cookies = parse_cookies(&map);
        assert_eq!(Some(&"1".to_string()), cookies.get("s"));
        assert_eq!(Some(&"x".to_string()), cookies.get("u"));
    }

    #[test]
    fn cookies_split_on_first_equals_and_decode() {
        let map = headers(&[("Cookie", "theme=dark%20mode; token=a=b; flag")]);
        let cookies = parse_cookies(&map);
        assert_eq!(Some(&"dark mode".to_string()), cookies.get("theme"));
        assert_eq!(Some(&"a=b".to_string()), cookies.get("token"));
        assert_eq!(Some(&String::new()), cookies.get("flag"));
    }

    #[test]
    fn form_bodies_use_the_query_parser() {
        let map = headers(&[("Content-Type", "application/x-www-form-urlencoded")]);
        let content = parse(&map, b"user=amy&tag[]=a&tag[]=b").unwrap();

        let Content::Form(form) = content else {
            panic!("expected form content");
        };
        assert_eq!(Some(&Value::Single("amy".to_string())), form.get("user"));
        assert_eq!(
            Some(&Value::Array(vec!["a".to_string(), "b".to_string()])),
            form.get("tag")
        );
    }

    #[test]
    fn json_bodies_parse_to_a_value() {
        let map = headers(&[("Content-Type", "application/json")]);
        let content = parse(&map, br#"{"data": "value"}"#).unwrap();

        let Content::Json(value) = content else {
            panic!("expected json content");
        };
        assert_eq!("value", value["data"]);
    }

    #[test]
    fn malformed_json_is_left_unparsed() {
        let map = headers(&[("Content-Type", "application/json")]);
        assert!(matches!(
            parse(&map, b"{not json").unwrap(),
            Content::None
        ));
    }

    #[test]
    fn unknown_media_types_are_ignored() {
        let map = headers(&[("Content-Type", "application/octet-stream")]);
        assert!(matches!(parse(&map, b"\x00\x01").unwrap(), Content::None));
        assert!(matches!(
            parse(&HeaderMap::new(), b"data").unwrap(),
            Content::None
        ));
    }

    #[test]
    fn multipart_fields_and_files_are_separated() {
        let map = headers(&[(
            "Content-Type",
            "multipart/form-data; boundary=----XyZ",
        )]);
        let body = b"------XyZ\r\n\
            Content-Disposition: form-data; name=\"title\"\r\n\r\n\
            hello world\r\n\
            ------XyZ\r\n\
            Content-Disposition: form-data; name=\"upload\"; filename=\"a.txt\"\r\n\
            Content-Type: text/plain\r\n\r\n\
            file contents\r\n\
            ------XyZ--\r\n";

        let Content::Multipart(form) = parse(&map, body).unwrap() else {
            panic!("expected multipart content");
        };

        assert_eq!(Some(&"hello world".to_string()), form.fields.get("title"));

        let upload = form.files.get("upload").expect("file part indexed by name");
        assert_eq!("a.txt", upload.filename);
        assert_eq!(Some("text/plain".to_string()), upload.content_type);
        assert_eq!(13, upload.size);

        let spilled = std::fs::read_to_string(upload.file.path()).unwrap();
        assert_eq!("file contents", spilled);
    }

    #[test]
    fn boundary_shape_is_validated() {
        assert!(valid_boundary("simple"));
        assert!(valid_boundary("with space inside"));
        assert!(valid_boundary("0123456789'()+_,-./:=?"));
        assert!(!valid_boundary(""));
        assert!(!valid_boundary("trailing space "));
        assert!(!valid_boundary(&"x".repeat(71)));
        assert!(!valid_boundary("angle<bracket"));

        let map = headers(&[("Content-Type", "multipart/form-data; boundary=bad<")]);
        assert_eq!(Err(ParseError::Boundary), parse(&map, b"x").map(|_| ()));

        let map = headers(&[("Content-Type", "multipart/form-data")]);
        assert_eq!(Err(ParseError::Boundary), parse(&map, b"x").map(|_| ()));
    }

    #[test]
    fn truncated_multipart_is_rejected() {
        let map = headers(&[("Content-Type", "multipart/form-data; boundary=b")]);
        assert_eq!(
            Err(ParseError::Multipart),
            parse(&map, b"--b\r\nno terminator").map(|_| ())
        );
    }
}

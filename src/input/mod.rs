pub mod form;

use axum::{
    async_trait,
    body::{Body, Bytes},
    extract::{FromRequest, Multipart, Request},
    http::{header::CONTENT_TYPE, StatusCode},
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::error::ApiError;

/// Field names redacted from audit data wherever they appear.
pub const SENSITIVE_FIELDS: [&str; 3] = ["password", "token", "key"];
pub const REDACTED: &str = "*****";

#[derive(Debug, Error, Clone, PartialEq)]
pub enum InputError {
    #[error("unable to parse as json: {0}")]
    Json(String),

    #[error("unable to parse form values: {0}")]
    Form(String),

    #[error("unable to parse multipart form: {0}")]
    Multipart(String),

    #[error("unable to read request body: {0}")]
    Body(String),

    #[error("{0}")]
    Invalid(String),
}

impl From<form::Error> for InputError {
    fn from(err: form::Error) -> Self {
        InputError::Form(err.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyKind {
    Empty,
    Json,
    Form,
    Multipart,
    Other,
}

/// A single submitted value as recorded in audit data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<FieldValue>),
}

impl FieldValue {
    pub fn text(value: impl Into<String>) -> Self {
        FieldValue::Text(value.into())
    }

    /// Scalar rendering used when feeding the form decoder.
    pub fn as_text(&self) -> String {
        match self {
            FieldValue::Bool(b) => b.to_string(),
            FieldValue::Int(i) => i.to_string(),
            FieldValue::Float(f) => f.to_string(),
            FieldValue::Text(s) => s.clone(),
            FieldValue::List(items) => items
                .iter()
                .map(FieldValue::as_text)
                .collect::<Vec<_>>()
                .join(","),
        }
    }
}

/// Ordered `(name, value)` entry recorded as event start data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputField {
    pub name: String,
    pub value: FieldValue,
}

impl InputField {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub field: String,
    pub file_name: Option<String>,
    pub content_type: Option<String>,
    pub data: Bytes,
}

/// Decoded request input. The raw body is kept so the proxy can forward it
/// untouched after the envelope has read it for auditing.
#[derive(Debug, Clone)]
pub struct RequestInput {
    kind: BodyKind,
    content_type: Option<String>,
    body: Bytes,
    body_pairs: Vec<(String, FieldValue)>,
    query_pairs: Vec<(String, String)>,
    files: Vec<UploadedFile>,
}

impl RequestInput {
    pub async fn decode(
        content_type: Option<&str>,
        query: Option<&str>,
        body: Bytes,
    ) -> Result<Self, InputError> {
        let kind = body_kind(content_type, &body);
        let query_pairs = query.map(parse_urlencoded).unwrap_or_default();

        let mut files = Vec::new();
        let body_pairs = match kind {
            BodyKind::Empty | BodyKind::Other => Vec::new(),
            BodyKind::Json => {
                let value: Value = serde_json::from_slice(&body)
                    .map_err(|e| InputError::Json(e.to_string()))?;
                let mut pairs = Vec::new();
                flatten_json("", &value, &mut pairs);
                pairs
            }
            BodyKind::Form => {
                let raw = std::str::from_utf8(&body)
                    .map_err(|e| InputError::Form(e.to_string()))?;
                parse_urlencoded(raw)
                    .into_iter()
                    .map(|(k, v)| (k, FieldValue::Text(v)))
                    .collect()
            }
            BodyKind::Multipart => {
                let (pairs, uploaded) =
                    decode_multipart(content_type.unwrap_or_default(), body.clone()).await?;
                files = uploaded;
                pairs
            }
        };

        Ok(Self {
            kind,
            content_type: content_type.map(str::to_string),
            body,
            body_pairs,
            query_pairs,
            files,
        })
    }

    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    /// The original body bytes.
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn files(&self) -> &[UploadedFile] {
        &self.files
    }

    pub fn file(&self, field: &str) -> Option<&UploadedFile> {
        self.files.iter().find(|f| f.field == field)
    }

    pub fn query_pairs(&self) -> &[(String, String)] {
        &self.query_pairs
    }

    /// Body pairs followed by query pairs. Internal `:`-prefixed query keys are skipped.
    pub fn pairs(&self) -> Vec<(String, String)> {
        self.body_pairs
            .iter()
            .map(|(k, v)| (k.clone(), v.as_text()))
            .chain(
                self.query_pairs
                    .iter()
                    .filter(|(k, _)| !k.starts_with(':'))
                    .cloned(),
            )
            .collect()
    }

    /// Decode the input into `T`: JSON bodies through serde_json, everything
    /// else through the case-insensitive form decoder.
    pub fn parse<T: DeserializeOwned>(&self) -> Result<T, InputError> {
        match self.kind {
            BodyKind::Json => {
                serde_json::from_slice(&self.body).map_err(|e| InputError::Json(e.to_string()))
            }
            _ => Ok(form::from_pairs(&self.pairs())?),
        }
    }

    pub fn input_value(&self, name: &str) -> Option<String> {
        self.pairs()
            .into_iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v)
    }

    pub fn input_values(&self, name: &str) -> Vec<String> {
        self.pairs()
            .into_iter()
            .filter(|(k, _)| k == name)
            .map(|(_, v)| v)
            .collect()
    }

    /// Parse a boolean input; absent or empty means false.
    pub fn input_bool(&self, name: &str) -> Result<bool, InputError> {
        match self.input_value(name).as_deref().map(str::trim) {
            None | Some("") => Ok(false),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" | "yes" => Ok(true),
                "false" | "0" | "off" | "no" => Ok(false),
                other => Err(InputError::Invalid(format!(
                    "invalid value {:?} for {}",
                    other, name
                ))),
            },
        }
    }

    /// Ordered audit fields with sensitive names redacted. Repeated names
    /// collapse into one list entry at the position of their first use.
    pub fn fields(&self, extra_sensitive: &[&str]) -> Vec<InputField> {
        let query = self
            .query_pairs
            .iter()
            .filter(|(k, _)| !k.starts_with(':'))
            .map(|(k, v)| (k.clone(), FieldValue::Text(v.clone())));

        let mut fields: Vec<InputField> = Vec::new();
        for (name, value) in self.body_pairs.iter().cloned().chain(query) {
            let value = if is_sensitive(&name, extra_sensitive) {
                FieldValue::text(REDACTED)
            } else {
                value
            };
            match fields.iter_mut().find(|f| f.name == name) {
                Some(existing) => match &mut existing.value {
                    FieldValue::List(items) => items.push(value),
                    other => {
                        let first = other.clone();
                        *other = FieldValue::List(vec![first, value]);
                    }
                },
                None => fields.push(InputField::new(name, value)),
            }
        }
        fields
    }
}

#[async_trait]
impl<S> FromRequest<S> for RequestInput
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let content_type = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let query = req.uri().query().map(str::to_string);
        let body = match Bytes::from_request(req, state).await {
            Ok(body) => body,
            Err(e) if e.status() == StatusCode::PAYLOAD_TOO_LARGE => {
                return Err(ApiError::payload_too_large(e.body_text()))
            }
            Err(e) => return Err(InputError::Body(e.body_text()).into()),
        };
        Ok(RequestInput::decode(content_type.as_deref(), query.as_deref(), body).await?)
    }
}

/// Whether `name` (or its last dotted segment) is a sensitive field.
pub fn is_sensitive(name: &str, extra: &[&str]) -> bool {
    let last = name.rsplit('.').next().unwrap_or(name);
    SENSITIVE_FIELDS
        .iter()
        .chain(extra.iter())
        .any(|s| s.eq_ignore_ascii_case(last) || s.eq_ignore_ascii_case(name))
}

fn body_kind(content_type: Option<&str>, body: &Bytes) -> BodyKind {
    if body.is_empty() {
        return BodyKind::Empty;
    }
    let mime = content_type
        .and_then(|ct| ct.split(';').next())
        .map(|m| m.trim().to_ascii_lowercase())
        .unwrap_or_default();
    match mime.as_str() {
        "application/json" => BodyKind::Json,
        "application/x-www-form-urlencoded" | "" => BodyKind::Form,
        m if m.starts_with("multipart/") => BodyKind::Multipart,
        m if m.ends_with("+json") => BodyKind::Json,
        _ => BodyKind::Other,
    }
}

fn parse_urlencoded(raw: &str) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

fn flatten_json(prefix: &str, value: &Value, out: &mut Vec<(String, FieldValue)>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let name = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                flatten_json(&name, child, out);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_json(prefix, item, out);
            }
        }
        Value::Null => out.push((prefix.to_string(), FieldValue::text(""))),
        Value::Bool(b) => out.push((prefix.to_string(), FieldValue::Bool(*b))),
        Value::Number(n) => {
            let value = match n.as_i64() {
                Some(i) => FieldValue::Int(i),
                None => FieldValue::Float(n.as_f64().unwrap_or_default()),
            };
            out.push((prefix.to_string(), value));
        }
        Value::String(s) => out.push((prefix.to_string(), FieldValue::text(s.clone()))),
    }
}

async fn decode_multipart(
    content_type: &str,
    body: Bytes,
) -> Result<(Vec<(String, FieldValue)>, Vec<UploadedFile>), InputError> {
    let request = axum::http::Request::builder()
        .header(CONTENT_TYPE, content_type)
        .body(Body::from(body))
        .map_err(|e| InputError::Multipart(e.to_string()))?;
    let mut multipart = Multipart::from_request(request, &())
        .await
        .map_err(|e| InputError::Multipart(e.body_text()))?;

    let mut pairs = Vec::new();
    let mut files = Vec::new();
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| InputError::Multipart(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let file_name = field.file_name().map(str::to_string);
        let field_type = field.content_type().map(str::to_string);
        let data = field
            .bytes()
            .await
            .map_err(|e| InputError::Multipart(e.body_text()))?;
        match file_name {
            Some(file_name) => files.push(UploadedFile {
                field: name,
                file_name: Some(file_name),
                content_type: field_type,
                data,
            }),
            None => {
                let text = String::from_utf8_lossy(&data).into_owned();
                pairs.push((name, FieldValue::Text(text)));
            }
        }
    }
    Ok((pairs, files))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    async fn decode(ct: &str, query: Option<&str>, body: &str) -> RequestInput {
        RequestInput::decode(Some(ct), query, Bytes::from(body.to_string()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_form_fields_are_ordered_and_scrubbed() {
        let input = decode(
            "application/x-www-form-urlencoded",
            Some("callback=/mypath&:internal=1"),
            "my=awesome&password=123&body=1&my=again",
        )
        .await;
        let fields = input.fields(&[]);
        let names: Vec<&str> = fields.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["my", "password", "body", "callback"]);
        assert_eq!(
            fields[0].value,
            FieldValue::List(vec![FieldValue::text("awesome"), FieldValue::text("again")])
        );
        assert_eq!(fields[1].value, FieldValue::text(REDACTED));
        assert_eq!(input.input_value("callback").as_deref(), Some("/mypath"));
        assert_eq!(input.input_value(":internal"), None);
    }

    #[tokio::test]
    async fn test_json_nested_secrets_are_scrubbed() {
        let input = decode(
            "application/json",
            None,
            r#"{"name":"db","credentials":{"password":"x","Token":"y"},"units":3,"tags":["a","b"]}"#,
        )
        .await;
        let fields = input.fields(&["secret"]);
        assert_eq!(fields[0], InputField::new("name", FieldValue::text("db")));
        assert_eq!(fields[1].value, FieldValue::text(REDACTED));
        assert_eq!(fields[2].value, FieldValue::text(REDACTED));
        assert_eq!(fields[3].value, FieldValue::Int(3));
        assert_eq!(
            fields[4].value,
            FieldValue::List(vec![FieldValue::text("a"), FieldValue::text("b")])
        );
    }

    #[tokio::test]
    async fn test_extra_sensitive_names() {
        let input = decode("application/x-www-form-urlencoded", None, "clientkey=abc&name=c1").await;
        let fields = input.fields(&["clientkey"]);
        assert_eq!(fields[0].value, FieldValue::text(REDACTED));
        assert_eq!(fields[1].value, FieldValue::text("c1"));
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Spec {
        process: String,
        #[serde(rename = "minUnits")]
        min_units: u32,
    }

    #[tokio::test]
    async fn test_parse_json_and_form() {
        let json = decode("application/json", None, r#"{"process":"p1","minUnits":2}"#).await;
        assert_eq!(
            json.parse::<Spec>().unwrap(),
            Spec { process: "p1".into(), min_units: 2 }
        );

        let form = decode("application/x-www-form-urlencoded", None, "Process=p1&minunits=2").await;
        assert_eq!(
            form.parse::<Spec>().unwrap(),
            Spec { process: "p1".into(), min_units: 2 }
        );
    }

    #[tokio::test]
    async fn test_malformed_json_is_rejected() {
        let err = RequestInput::decode(Some("application/json"), None, Bytes::from("{nope"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("unable to parse as json"));
    }

    #[tokio::test]
    async fn test_multipart_fields_and_files() {
        let boundary = "XBOUNDARY";
        let body = format!(
            "--{b}\r\nContent-Disposition: form-data; name=\"image\"\r\n\r\ntsuru/app\r\n\
             --{b}\r\nContent-Disposition: form-data; name=\"file\"; filename=\"app.tar.gz\"\r\n\
             Content-Type: application/octet-stream\r\n\r\nDATA\r\n--{b}--\r\n",
            b = boundary
        );
        let input = decode(
            &format!("multipart/form-data; boundary={}", boundary),
            None,
            &body,
        )
        .await;
        assert_eq!(input.kind(), BodyKind::Multipart);
        assert_eq!(input.input_value("image").as_deref(), Some("tsuru/app"));
        let file = input.file("file").unwrap();
        assert_eq!(file.file_name.as_deref(), Some("app.tar.gz"));
        assert_eq!(&file.data[..], b"DATA");
        assert_eq!(input.body().len(), body.len());
    }

    #[tokio::test]
    async fn test_form_maps() {
        let input = decode(
            "application/x-www-form-urlencoded",
            None,
            "name=db&parameters.size=large",
        )
        .await;

        #[derive(Deserialize)]
        struct Create {
            #[serde(default)]
            parameters: BTreeMap<String, String>,
        }
        let create: Create = input.parse().unwrap();
        assert_eq!(create.parameters["size"], "large");
    }
}

//! ABOUTME: Text decoding into structured values: json, xml, csv, and regex formats
//! ABOUTME: Strict mode enforces the configured schema; lenient mode falls back

use crate::context::RunContext;
use crate::executor::{per_message, FlowStream, StepExecutor};
use crate::message::FlowMessage;
use qtype_core::{codes, Value};
use qtype_dsl::document::steps::DecoderFormat;
use qtype_semantics::StepIr;
use quick_xml::events::Event;
use std::collections::BTreeMap;
use std::sync::Arc;

pub struct DecoderExecutor {
    step: Arc<StepIr>,
    format: DecoderFormat,
    schema: Option<serde_json::Value>,
    strict_mode: bool,
    fallback: Option<serde_json::Value>,
    delimiter: char,
    has_headers: bool,
    pattern: Option<regex::Regex>,
}

impl DecoderExecutor {
    pub fn build(
        step: Arc<StepIr>,
        format: DecoderFormat,
        schema: Option<serde_json::Value>,
        strict_mode: bool,
        fallback: Option<serde_json::Value>,
        delimiter: char,
        has_headers: bool,
        pattern: Option<String>,
    ) -> qtype_core::Result<Self> {
        let pattern = match pattern {
            Some(raw) => Some(regex::Regex::new(&raw).map_err(|err| {
                qtype_core::QTypeError::fatal(format!("invalid decoder pattern: {err}"))
            })?),
            None => None,
        };
        Ok(Self {
            step,
            format,
            schema,
            strict_mode,
            fallback,
            delimiter,
            has_headers,
            pattern,
        })
    }

    fn decode(&self, message: &FlowMessage) -> FlowMessage {
        let (Some(input), Some(output)) = (self.step.inputs.first(), self.step.outputs.first())
        else {
            return message.clone();
        };
        let text = match message.get(&input.id) {
            Some(value) => value.render(),
            None => {
                return message.failed(
                    codes::DECODE_ERROR,
                    format!("input variable '{}' has no value", input.id),
                    Some(&self.step.id),
                )
            }
        };

        let decoded = match self.format {
            DecoderFormat::Json => self.decode_json(&text),
            DecoderFormat::Xml => decode_xml(&text),
            DecoderFormat::Csv => self.decode_csv(&text),
            DecoderFormat::Custom => self.decode_custom(&text),
        };

        match decoded {
            Ok(value) => message.with_variable(output.id.clone(), value),
            Err(detail) => {
                // Lenient decoding substitutes the configured fallback.
                if !self.strict_mode {
                    if let Some(fallback) = &self.fallback {
                        return message
                            .with_variable(output.id.clone(), Value::from_json(fallback));
                    }
                }
                message.failed(codes::DECODE_ERROR, detail, Some(&self.step.id))
            }
        }
    }

    fn decode_json(&self, text: &str) -> Result<Value, String> {
        let parsed: serde_json::Value =
            serde_json::from_str(text).map_err(|err| format!("invalid JSON: {err}"))?;
        if self.strict_mode {
            if let Some(schema) = &self.schema {
                let compiled = jsonschema::JSONSchema::compile(schema)
                    .map_err(|err| format!("invalid schema: {err}"))?;
                if let Err(errors) = compiled.validate(&parsed) {
                    let details: Vec<String> = errors.map(|e| e.to_string()).collect();
                    return Err(format!("schema violation: {}", details.join("; ")));
                };
            }
        }
        Ok(Value::from_json(&parsed))
    }

    fn decode_csv(&self, text: &str) -> Result<Value, String> {
        let mut builder = csv::ReaderBuilder::new();
        builder
            .delimiter(self.delimiter as u8)
            .has_headers(self.has_headers);
        let mut reader = builder.from_reader(text.as_bytes());
        let headers: Vec<String> = if self.has_headers {
            reader
                .headers()
                .map_err(|err| format!("invalid CSV: {err}"))?
                .iter()
                .map(ToString::to_string)
                .collect()
        } else {
            Vec::new()
        };
        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|err| format!("invalid CSV row: {err}"))?;
            if self.has_headers {
                let mut object = BTreeMap::new();
                for (index, cell) in record.iter().enumerate() {
                    let key = headers
                        .get(index)
                        .cloned()
                        .unwrap_or_else(|| index.to_string());
                    object.insert(key, Value::Text(cell.to_string()));
                }
                rows.push(Value::Object(object));
            } else {
                rows.push(Value::List(
                    record.iter().map(|cell| Value::Text(cell.to_string())).collect(),
                ));
            }
        }
        Ok(Value::List(rows))
    }

    fn decode_custom(&self, text: &str) -> Result<Value, String> {
        let Some(pattern) = &self.pattern else {
            return Err("custom decoder has no pattern".to_string());
        };
        let Some(captures) = pattern.captures(text) else {
            return Err(format!("pattern '{pattern}' matched nothing"));
        };
        let mut object = BTreeMap::new();
        for name in pattern.capture_names().flatten() {
            if let Some(matched) = captures.name(name) {
                object.insert(name.to_string(), Value::Text(matched.as_str().to_string()));
            }
        }
        Ok(Value::Object(object))
    }
}

/// Convert XML into nested objects: child elements become fields, repeated
/// children become lists, text content lands in `#text`, attributes in
/// `@name`.
fn decode_xml(text: &str) -> Result<Value, String> {
    let mut reader = quick_xml::Reader::from_str(text);
    reader.config_mut().trim_text(true);

    fn parse_element(
        reader: &mut quick_xml::Reader<&[u8]>,
        start: &quick_xml::events::BytesStart<'_>,
    ) -> Result<Value, String> {
        let mut object: BTreeMap<String, Value> = BTreeMap::new();
        for attr in start.attributes().flatten() {
            let key = format!("@{}", String::from_utf8_lossy(attr.key.as_ref()));
            let value = String::from_utf8_lossy(&attr.value).to_string();
            object.insert(key, Value::Text(value));
        }
        let mut text_content = String::new();
        loop {
            match reader.read_event().map_err(|err| format!("invalid XML: {err}"))? {
                Event::Start(child) => {
                    let name = String::from_utf8_lossy(child.name().as_ref()).to_string();
                    let child_start = child.to_owned();
                    let value = parse_element(reader, &child_start)?;
                    insert_child(&mut object, name, value);
                }
                Event::Empty(child) => {
                    let name = String::from_utf8_lossy(child.name().as_ref()).to_string();
                    insert_child(&mut object, name, Value::Object(BTreeMap::new()));
                }
                Event::Text(content) => {
                    text_content.push_str(
                        &content
                            .unescape()
                            .map_err(|err| format!("invalid XML text: {err}"))?,
                    );
                }
                Event::End(_) => break,
                Event::Eof => return Err("unexpected end of XML".to_string()),
                _ => {}
            }
        }
        if object.is_empty() && !text_content.is_empty() {
            return Ok(Value::Text(text_content));
        }
        if !text_content.is_empty() {
            object.insert("#text".to_string(), Value::Text(text_content));
        }
        Ok(Value::Object(object))
    }

    fn insert_child(object: &mut BTreeMap<String, Value>, name: String, value: Value) {
        match object.remove(&name) {
            None => {
                object.insert(name, value);
            }
            Some(Value::List(mut items)) => {
                items.push(value);
                object.insert(name, Value::List(items));
            }
            Some(existing) => {
                object.insert(name, Value::List(vec![existing, value]));
            }
        }
    }

    loop {
        match reader.read_event().map_err(|err| format!("invalid XML: {err}"))? {
            Event::Start(root) => {
                let name = String::from_utf8_lossy(root.name().as_ref()).to_string();
                let root_start = root.to_owned();
                let value = parse_element(&mut reader, &root_start)?;
                let mut object = BTreeMap::new();
                object.insert(name, value);
                return Ok(Value::Object(object));
            }
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
            Event::Eof => return Err("empty XML document".to_string()),
            other => return Err(format!("unexpected XML content: {other:?}")),
        }
    }
}

impl StepExecutor for DecoderExecutor {
    fn execute(self: Arc<Self>, input: FlowStream, ctx: Arc<RunContext>) -> FlowStream {
        let step = Arc::clone(&self.step);
        per_message(input, ctx, step, move |message| {
            let this = Arc::clone(&self);
            async move { this.decode(&message) }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use qtype_dsl::document::steps::StepCardinality;
    use qtype_semantics::{StepKindIr, StreamCardinality};
    use std::sync::Arc;

    fn json_decoder(strict: bool) -> DecoderExecutor {
        let step = Arc::new(StepIr {
            id: "parse".to_string(),
            kind: StepKindIr::Echo { delay_ms: None },
            inputs: vec![],
            outputs: vec![],
            cardinality: StepCardinality::OneToOne,
            input_stream: StreamCardinality::One,
            concurrency: None,
            batch_size: None,
        });
        DecoderExecutor::build(step, DecoderFormat::Json, None, strict, None, ',', true, None)
            .unwrap()
    }

    // Lenient json decoding undoes encoding exactly.
    #[test]
    fn json_decode_inverts_encode() {
        let original = Value::Object(BTreeMap::from([
            ("name".to_string(), Value::Text("ada".to_string())),
            ("scores".to_string(), Value::List(vec![Value::Int(1), Value::Int(2)])),
            ("active".to_string(), Value::Bool(true)),
        ]));
        let encoded = serde_json::to_string(&original.to_json()).unwrap();
        let decoded = json_decoder(false).decode_json(&encoded).unwrap();
        assert_eq!(decoded, original);
    }

    #[test]
    fn strict_json_rejects_schema_violations() {
        let step = Arc::new(StepIr {
            id: "parse".to_string(),
            kind: StepKindIr::Echo { delay_ms: None },
            inputs: vec![],
            outputs: vec![],
            cardinality: StepCardinality::OneToOne,
            input_stream: StreamCardinality::One,
            concurrency: None,
            batch_size: None,
        });
        let schema = serde_json::json!({
            "type": "object",
            "required": ["name"],
            "properties": { "name": { "type": "string" } }
        });
        let decoder = DecoderExecutor::build(
            step,
            DecoderFormat::Json,
            Some(schema),
            true,
            None,
            ',',
            true,
            None,
        )
        .unwrap();
        assert!(decoder.decode_json(r#"{"name": "ok"}"#).is_ok());
        assert!(decoder.decode_json(r#"{"name": 7}"#).is_err());
    }

    #[test]
    fn csv_rows_decode_to_objects() {
        let decoder = json_decoder(false);
        let mut csv_decoder = decoder;
        csv_decoder.format = DecoderFormat::Csv;
        let value = csv_decoder.decode_csv("a,b\n1,2\n3,4\n").unwrap();
        let rows = value.as_list().unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(
            rows[0].as_object().unwrap().get("a"),
            Some(&Value::Text("1".to_string()))
        );
    }

    #[test]
    fn xml_nests_elements_and_attributes() {
        let value = decode_xml(r#"<doc id="7"><title>Hi</title><tag>a</tag><tag>b</tag></doc>"#)
            .unwrap();
        let doc = value.as_object().unwrap().get("doc").unwrap();
        let doc = doc.as_object().unwrap();
        assert_eq!(doc.get("@id"), Some(&Value::Text("7".to_string())));
        assert_eq!(doc.get("title"), Some(&Value::Text("Hi".to_string())));
        assert!(matches!(doc.get("tag"), Some(Value::List(items)) if items.len() == 2));
    }

    #[test]
    fn malformed_xml_is_an_error() {
        assert!(decode_xml("<open>").is_err());
        assert!(decode_xml("").is_err());
    }
}

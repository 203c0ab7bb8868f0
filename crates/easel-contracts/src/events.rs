use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::layout::{PlaceholderSpec, Point};
use crate::request::RequestKind;

pub type EventPayload = Map<String, Value>;

/// Concrete image representation handed to the canvas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ImageSource {
    Inline { data: String },
    Remote { url: String },
}

impl ImageSource {
    pub fn as_str(&self) -> &str {
        match self {
            ImageSource::Inline { data } => data,
            ImageSource::Remote { url } => url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutHints {
    pub center: Point,
    pub width: f64,
    pub height: f64,
    pub group_id: Option<String>,
    pub group_index: Option<u32>,
    pub group_total: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceImage {
    pub source: ImageSource,
    pub file_name: String,
    pub operation: RequestKind,
    pub layout: LayoutHints,
    pub placeholder_id: Option<String>,
}

/// Fire-and-forget notifications consumed by the rendering layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanvasEvent {
    ShowPlaceholder { spec: PlaceholderSpec },
    RemovePlaceholder { placeholder_id: String },
    UpdatePlaceholderProgress { placeholder_id: String, percent: u8 },
    PlaceImage(PlaceImage),
}

impl CanvasEvent {
    pub fn type_name(&self) -> &'static str {
        match self {
            CanvasEvent::ShowPlaceholder { .. } => "show_placeholder",
            CanvasEvent::RemovePlaceholder { .. } => "remove_placeholder",
            CanvasEvent::UpdatePlaceholderProgress { .. } => "update_placeholder_progress",
            CanvasEvent::PlaceImage(_) => "place_image",
        }
    }
}

/// Outbound port towards the canvas. The engine only ever talks to this.
pub trait CanvasEventSink: Send + Sync {
    fn publish(&self, event: CanvasEvent);

    fn show_placeholder(&self, spec: &PlaceholderSpec) {
        self.publish(CanvasEvent::ShowPlaceholder { spec: spec.clone() });
    }

    fn remove_placeholder(&self, placeholder_id: &str) {
        self.publish(CanvasEvent::RemovePlaceholder {
            placeholder_id: placeholder_id.to_string(),
        });
    }

    fn update_progress(&self, placeholder_id: &str, percent: u8) {
        self.publish(CanvasEvent::UpdatePlaceholderProgress {
            placeholder_id: placeholder_id.to_string(),
            percent,
        });
    }

    fn place_image(&self, payload: PlaceImage) {
        self.publish(CanvasEvent::PlaceImage(payload));
    }
}

/// Append-only writer for `events.jsonl`.
///
/// - default fields are `type`, `run_id`, `ts`
/// - caller payload is merged last and can override defaults
/// - one compact JSON object per line
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    run_id: String,
    lock: Mutex<()>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                run_id: run_id.into(),
                lock: Mutex::new(()),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert(
            "run_id".to_string(),
            Value::String(self.inner.run_id.clone()),
        );
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        for (key, value) in payload {
            event.insert(key, value);
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let line = serde_json::to_string(&event)?;
        let _guard = self
            .inner
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;

        Ok(Value::Object(event))
    }

    pub fn emit_canvas(&self, event: &CanvasEvent) -> anyhow::Result<Value> {
        let mut payload = match serde_json::to_value(event)? {
            Value::Object(map) => map,
            other => anyhow::bail!("canvas event serialized to non-object: {other}"),
        };
        payload.remove("type");
        self.emit(event.type_name(), payload)
    }
}

impl CanvasEventSink for EventWriter {
    fn publish(&self, event: CanvasEvent) {
        if let Err(err) = self.emit_canvas(&event) {
            tracing::warn!(
                target: "events",
                event = event.type_name(),
                "failed to journal canvas event: {err:#}"
            );
        }
    }
}

/// In-process sink that keeps every event; handy for embedding and tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<CanvasEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<CanvasEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn shown(&self) -> Vec<PlaceholderSpec> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CanvasEvent::ShowPlaceholder { spec } => Some(spec),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CanvasEvent::RemovePlaceholder { placeholder_id } => Some(placeholder_id),
                _ => None,
            })
            .collect()
    }

    pub fn placed(&self) -> Vec<PlaceImage> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CanvasEvent::PlaceImage(payload) => Some(payload),
                _ => None,
            })
            .collect()
    }

    pub fn progress_for(&self, placeholder_id: &str) -> Vec<u8> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                CanvasEvent::UpdatePlaceholderProgress {
                    placeholder_id: id,
                    percent,
                } if id == placeholder_id => Some(percent),
                _ => None,
            })
            .collect()
    }
}

impl CanvasEventSink for MemorySink {
    fn publish(&self, event: CanvasEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

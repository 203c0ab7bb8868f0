use serde::{Deserialize, Serialize};

use crate::request::RequestKind;

const PLACEHOLDER_PREFIX: &str = "ai-placeholder-";

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    pub fn offset(self, dx: f64, dy: f64) -> Self {
        Self {
            x: self.x + dx,
            y: self.y + dy,
        }
    }
}

/// Axis-aligned box in canvas coordinates, anchored at its top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Rect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl Rect {
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn centered(center: Point, width: f64, height: f64) -> Self {
        Self {
            x: center.x - width / 2.0,
            y: center.y - height / 2.0,
            width,
            height,
        }
    }

    pub fn center(&self) -> Point {
        Point::new(self.x + self.width / 2.0, self.y + self.height / 2.0)
    }

    pub fn right(&self) -> f64 {
        self.x + self.width
    }

    pub fn bottom(&self) -> f64 {
        self.y + self.height
    }

    /// Strict overlap; boxes that only share an edge do not intersect.
    pub fn intersects(&self, other: &Rect) -> bool {
        self.x < other.right()
            && other.x < self.right()
            && self.y < other.bottom()
            && other.y < self.bottom()
    }
}

/// Speculative visual shown on the canvas while a request is in flight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceholderSpec {
    pub placeholder_id: String,
    pub center: Point,
    pub width: f64,
    pub height: f64,
    pub operation: RequestKind,
    pub group_id: Option<String>,
    pub group_index: Option<u32>,
    pub group_total: Option<u32>,
    pub anchor: Option<Point>,
}

impl PlaceholderSpec {
    pub fn rect(&self) -> Rect {
        Rect::centered(self.center, self.width, self.height)
    }
}

/// Placeholder ids are derived from the owning message so that every
/// status write for that message can address the same canvas node.
pub fn placeholder_id_for(message_id: &str) -> String {
    format!("{PLACEHOLDER_PREFIX}{message_id}")
}

pub fn message_id_for(placeholder_id: &str) -> Option<&str> {
    placeholder_id.strip_prefix(PLACEHOLDER_PREFIX)
}

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The tool a logical generation request is routed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Generate,
    Edit,
    Blend,
    Analyze,
    Chat,
    Vectorize,
    Video,
}

/// Direction a predicted placeholder is nudged in when its cell is taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    Horizontal,
    Vertical,
}

impl RequestKind {
    pub const ALL: [RequestKind; 7] = [
        RequestKind::Generate,
        RequestKind::Edit,
        RequestKind::Blend,
        RequestKind::Analyze,
        RequestKind::Chat,
        RequestKind::Vectorize,
        RequestKind::Video,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RequestKind::Generate => "generate",
            RequestKind::Edit => "edit",
            RequestKind::Blend => "blend",
            RequestKind::Analyze => "analyze",
            RequestKind::Chat => "chat",
            RequestKind::Vectorize => "vectorize",
            RequestKind::Video => "video",
        }
    }

    /// Model capability a provider must advertise to serve this kind.
    pub fn capability(self) -> &'static str {
        match self {
            RequestKind::Generate => "image",
            RequestKind::Edit => "edit",
            RequestKind::Blend => "blend",
            RequestKind::Analyze => "vision",
            RequestKind::Chat => "text",
            RequestKind::Vectorize => "vector",
            RequestKind::Video => "video",
        }
    }

    /// Image-generation-class operations are the only ones that fan out
    /// and the only ones eligible for model degradation on quota errors.
    pub fn is_image_class(self) -> bool {
        matches!(
            self,
            RequestKind::Generate | RequestKind::Edit | RequestKind::Blend
        )
    }

    pub fn expects_image(self) -> bool {
        matches!(
            self,
            RequestKind::Generate | RequestKind::Edit | RequestKind::Blend | RequestKind::Vectorize
        )
    }

    pub fn expects_video(self) -> bool {
        self == RequestKind::Video
    }

    pub fn expects_visual(self) -> bool {
        self.expects_image() || self.expects_video()
    }

    /// Whether the request operates on an existing image (explicit or cached).
    pub fn needs_source(self) -> bool {
        matches!(
            self,
            RequestKind::Edit | RequestKind::Analyze | RequestKind::Vectorize
        )
    }

    pub fn collision_axis(self) -> Axis {
        match self {
            RequestKind::Edit | RequestKind::Blend => Axis::Horizontal,
            _ => Axis::Vertical,
        }
    }
}

impl fmt::Display for RequestKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RequestKind {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        RequestKind::ALL
            .iter()
            .copied()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| format!("Unknown request kind '{raw}'."))
    }
}

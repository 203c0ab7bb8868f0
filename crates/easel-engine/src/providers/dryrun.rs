use std::io::Cursor;

use async_trait::async_trait;
use easel_contracts::providers::{
    ProviderFailure, ProviderOutcome, ProviderPayload, ProviderRequest,
};
use image::{ImageFormat, Rgb, RgbImage};
use sha2::{Digest, Sha256};

use super::GenerationProvider;
use crate::assets::media::encode_data_url;
use crate::config::parse_aspect_ratio;

const DRYRUN_LONG_SIDE: u32 = 256;

/// Offline provider: deterministic solid-colour images keyed by prompt.
#[derive(Debug, Clone, Default)]
pub struct DryrunProvider;

impl DryrunProvider {
    pub fn new() -> Self {
        Self
    }

    fn image(&self, request: &ProviderRequest, salt: u64) -> ProviderOutcome {
        let (width, height) = dims_for(&request.aspect_ratio);
        let (r, g, b) = color_from_prompt(&request.prompt, salt);
        let image = RgbImage::from_pixel(width, height, Rgb([r, g, b]));
        let mut bytes = Cursor::new(Vec::new());
        if let Err(err) = image.write_to(&mut bytes, ImageFormat::Png) {
            return ProviderOutcome::Failure(ProviderFailure::other(
                Some("dryrun_encode".to_string()),
                format!("failed encoding dry-run image: {err}"),
            ));
        }
        ProviderOutcome::Success(ProviderPayload {
            text: Some(format!(
                "Dry-run {} ({width}x{height}) for \"{}\".",
                request.kind,
                request.prompt.trim()
            )),
            image_data: Some(encode_data_url(&bytes.into_inner(), "image/png")),
            ..ProviderPayload::default()
        })
    }
}

#[async_trait]
impl GenerationProvider for DryrunProvider {
    fn name(&self) -> &str {
        "dryrun"
    }

    async fn generate(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.image(request, 0)
    }

    async fn edit(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.image(request, 1)
    }

    async fn blend(&self, request: &ProviderRequest) -> ProviderOutcome {
        self.image(request, request.source_images.len() as u64)
    }

    async fn analyze(&self, request: &ProviderRequest) -> ProviderOutcome {
        let count = request.source_images.len().max(1);
        ProviderOutcome::Success(ProviderPayload {
            text: Some(format!(
                "Dry-run analysis of {count} image(s): {}",
                request.prompt.trim()
            )),
            ..ProviderPayload::default()
        })
    }

    async fn chat(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::Success(ProviderPayload {
            text: Some(format!("Dry-run reply to: {}", request.prompt.trim())),
            ..ProviderPayload::default()
        })
    }

    async fn vectorize(&self, request: &ProviderRequest) -> ProviderOutcome {
        let (r, g, b) = color_from_prompt(&request.prompt, 2);
        let svg = format!(
            "<svg xmlns=\"http://www.w3.org/2000/svg\" width=\"256\" height=\"256\"><rect width=\"256\" height=\"256\" fill=\"#{r:02x}{g:02x}{b:02x}\"/></svg>"
        );
        ProviderOutcome::Success(ProviderPayload {
            text: Some("Dry-run vector trace.".to_string()),
            image_data: Some(encode_data_url(svg.as_bytes(), "image/svg+xml")),
            ..ProviderPayload::default()
        })
    }

    async fn video(&self, request: &ProviderRequest) -> ProviderOutcome {
        ProviderOutcome::Success(ProviderPayload {
            text: Some("Dry-run video clip.".to_string()),
            video_url: Some(format!(
                "dryrun://video/{}.mp4",
                short_id(&request.prompt, 0)
            )),
            ..ProviderPayload::default()
        })
    }
}

fn dims_for(aspect_ratio: &str) -> (u32, u32) {
    let (w, h) = parse_aspect_ratio(aspect_ratio).unwrap_or((1.0, 1.0));
    let long = f64::from(DRYRUN_LONG_SIDE);
    if w >= h {
        (DRYRUN_LONG_SIDE, ((long * h / w).round() as u32).max(1))
    } else {
        (((long * w / h).round() as u32).max(1), DRYRUN_LONG_SIDE)
    }
}

fn color_from_prompt(prompt: &str, seed: u64) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(seed.to_be_bytes());
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

fn short_id(prompt: &str, idx: u64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prompt.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..4])
}

#[cfg(test)]
mod tests {
    use easel_contracts::providers::{ProviderOutcome, ProviderRequest};
    use easel_contracts::RequestKind;

    use super::{dims_for, DryrunProvider};
    use crate::assets::media::decode_data_url;
    use crate::providers::invoke;

    fn request(kind: RequestKind, prompt: &str) -> ProviderRequest {
        ProviderRequest {
            kind,
            prompt: prompt.to_string(),
            model: "dryrun-image-1".to_string(),
            aspect_ratio: "16:9".to_string(),
            source_images: Vec::new(),
            web_search: false,
        }
    }

    #[tokio::test]
    async fn generate_is_deterministic_png() -> anyhow::Result<()> {
        let provider = DryrunProvider::new();
        let first = invoke(&provider, &request(RequestKind::Generate, "a red cube")).await;
        let second = invoke(&provider, &request(RequestKind::Generate, "a red cube")).await;
        assert_eq!(first, second);

        let ProviderOutcome::Success(payload) = first else {
            panic!("expected success");
        };
        let (bytes, mime) = decode_data_url(payload.image_data.as_deref().unwrap_or_default())?;
        assert_eq!(mime, "image/png");
        let image = image::load_from_memory(&bytes)?;
        assert_eq!((image.width(), image.height()), (256, 144));
        Ok(())
    }

    #[tokio::test]
    async fn non_image_kinds_answer_in_their_own_shape() {
        let provider = DryrunProvider::new();
        let ProviderOutcome::Success(chat) =
            invoke(&provider, &request(RequestKind::Chat, "hello")).await
        else {
            panic!("chat failed");
        };
        assert!(chat.image_data.is_none());
        assert_eq!(chat.text.as_deref(), Some("Dry-run reply to: hello"));

        let ProviderOutcome::Success(video) =
            invoke(&provider, &request(RequestKind::Video, "waves")).await
        else {
            panic!("video failed");
        };
        assert!(video.satisfies(RequestKind::Video));

        let ProviderOutcome::Success(vector) =
            invoke(&provider, &request(RequestKind::Vectorize, "logo")).await
        else {
            panic!("vectorize failed");
        };
        assert!(vector
            .image_data
            .as_deref()
            .is_some_and(|data| data.starts_with("data:image/svg+xml;base64,")));
    }

    #[test]
    fn dims_follow_aspect_ratio() {
        assert_eq!(dims_for("1:1"), (256, 256));
        assert_eq!(dims_for("9:16"), (144, 256));
        assert_eq!(dims_for("garbage"), (256, 256));
    }
}

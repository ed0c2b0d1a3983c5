//! Nutrition-facts extraction from label images with a vision model.

use axum::extract::{DefaultBodyLimit, State};
use axum::routing::{post, MethodRouter};
use axum::{Extension, Json};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::auth::AuthenticatedUser;
use crate::config::VisionRuntimeConfig;
use crate::error::{sanitize, AppError};
use crate::rate_limit::ProtectedEndpoint;
use crate::routes::{user_fingerprint, AppState};
use crate::supabase::parse_api_error;

pub const MAX_IMAGE_BYTES: usize = 10 * 1024 * 1024;
/// Base64 of a full-size image plus room for the JSON envelope and a data-URL prefix
pub const MAX_REQUEST_BYTES: usize = MAX_IMAGE_BYTES.div_ceil(3) * 4 + 64 * 1024;
const DEFAULT_MIME_TYPE: &str = "image/png";

const EXTRACTION_PROMPT: &str = "You read nutrition facts panels from food labels. \
Return only a JSON object with these keys: serving_size (string), \
servings_per_container (number), calories, total_fat_g, saturated_fat_g, \
trans_fat_g, cholesterol_mg, sodium_mg, total_carbohydrate_g, dietary_fiber_g, \
total_sugars_g, added_sugars_g, protein_g, vitamin_d_mcg, calcium_mg, iron_mg, \
potassium_mg (numbers), ingredients (string), allergens (array of strings) and \
confidence (0-100, how legible and complete the panel was). Use null for values \
that are not printed on the label. Do not guess.";

#[derive(Debug, Deserialize)]
pub struct ExtractRequest {
    #[serde(alias = "imageBase64", alias = "image")]
    pub image_base64: String,
    #[serde(default, alias = "mimeType")]
    pub mime_type: Option<String>,
}

/// Values read from one nutrition panel; the confidence is model-reported.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NutritionFacts {
    pub serving_size: Option<String>,
    pub servings_per_container: Option<f64>,
    pub calories: Option<f64>,
    pub total_fat_g: Option<f64>,
    pub saturated_fat_g: Option<f64>,
    pub trans_fat_g: Option<f64>,
    pub cholesterol_mg: Option<f64>,
    pub sodium_mg: Option<f64>,
    pub total_carbohydrate_g: Option<f64>,
    pub dietary_fiber_g: Option<f64>,
    pub total_sugars_g: Option<f64>,
    pub added_sugars_g: Option<f64>,
    pub protein_g: Option<f64>,
    pub vitamin_d_mcg: Option<f64>,
    pub calcium_mg: Option<f64>,
    pub iron_mg: Option<f64>,
    pub potassium_mg: Option<f64>,
    pub ingredients: Option<String>,
    pub allergens: Vec<String>,
    pub confidence: f64,
}

#[derive(Debug, Serialize)]
pub struct ExtractResponse {
    pub success: bool,
    pub data: NutritionFacts,
    pub confidence: f64,
}

/// Validated image ready to embed in a data URL
#[derive(Debug, PartialEq, Eq)]
pub struct LabelImage {
    pub mime_type: String,
    pub base64: String,
}

impl LabelImage {
    pub fn parse(raw: &str, mime_type: Option<&str>) -> Result<Self, AppError> {
        let raw = raw.trim();
        let (prefix_mime, payload) = match raw.strip_prefix("data:") {
            Some(rest) => {
                let (header, payload) = rest
                    .split_once(',')
                    .ok_or_else(|| AppError::bad_request("Malformed data URL"))?;
                let mime = header.split(';').next().unwrap_or_default().trim();
                (Some(mime.to_string()).filter(|mime| !mime.is_empty()), payload)
            }
            None => (None, raw),
        };

        let mime_type = mime_type
            .map(str::trim)
            .filter(|mime| !mime.is_empty())
            .map(str::to_ascii_lowercase)
            .or(prefix_mime)
            .unwrap_or_else(|| DEFAULT_MIME_TYPE.to_string());
        if !mime_type.starts_with("image/") {
            return Err(AppError::bad_request(format!(
                "Unsupported image type `{mime_type}`"
            )));
        }

        let base64: String = payload.chars().filter(|c| !c.is_whitespace()).collect();
        if base64.is_empty() {
            return Err(AppError::bad_request("`image_base64` is required"));
        }
        // decoded size is about 3/4 of the encoded length
        if base64.len() / 4 * 3 > MAX_IMAGE_BYTES + 3 {
            return Err(AppError::bad_request("Image exceeds the 10 MiB limit"));
        }
        let decoded = STANDARD
            .decode(&base64)
            .map_err(|_| AppError::bad_request("`image_base64` is not valid base64"))?;
        if decoded.len() > MAX_IMAGE_BYTES {
            return Err(AppError::bad_request("Image exceeds the 10 MiB limit"));
        }

        Ok(Self { mime_type, base64 })
    }

    fn data_url(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.base64)
    }
}

/// Extraction handler with a body limit large enough for [`MAX_IMAGE_BYTES`] images
pub fn extract_route() -> MethodRouter<AppState> {
    post(extract_nutrition).layer(DefaultBodyLimit::max(MAX_REQUEST_BYTES))
}

pub async fn extract_nutrition(
    State(state): State<AppState>,
    Extension(user): Extension<AuthenticatedUser>,
    Json(payload): Json<ExtractRequest>,
) -> Result<Json<ExtractResponse>, AppError> {
    let config = state
        .config
        .vision
        .as_ref()
        .ok_or_else(|| AppError::config("Vision extraction is not configured"))?;
    state
        .rate_limiter
        .check(ProtectedEndpoint::Extraction, &user.user_id)
        .await?;

    let image = LabelImage::parse(&payload.image_base64, payload.mime_type.as_deref())?;
    let reply = request_completion(&state.http, config, &image).await?;
    let facts = parse_facts(&reply)?;

    tracing::info!(
        user = user_fingerprint(&user.user_id),
        confidence = facts.confidence,
        "Nutrition facts extracted"
    );
    Ok(Json(ExtractResponse {
        success: true,
        confidence: facts.confidence,
        data: facts,
    }))
}

async fn request_completion(
    client: &reqwest::Client,
    config: &VisionRuntimeConfig,
    image: &LabelImage,
) -> Result<String, AppError> {
    let body = json!({
        "model": config.model,
        "temperature": 0,
        "max_tokens": 1500,
        "messages": [
            { "role": "system", "content": EXTRACTION_PROMPT },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": "Extract the nutrition facts from this label." },
                    { "type": "image_url", "image_url": { "url": image.data_url() } }
                ]
            }
        ]
    });

    let response = client
        .post(&config.api_url)
        .bearer_auth(&config.api_key)
        .json(&body)
        .send()
        .await
        .map_err(|error| {
            AppError::external(format!("Vision request failed: {}", sanitize(&error)))
        })?;
    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        return Err(AppError::external(format!(
            "Vision model error: {}",
            parse_api_error(status, &text)
        )));
    }

    let payload = response.json::<Value>().await.map_err(|error| {
        AppError::external(format!("Vision response parse failed: {}", sanitize(&error)))
    })?;
    payload["choices"][0]["message"]["content"]
        .as_str()
        .map(ToString::to_string)
        .ok_or_else(|| AppError::external("Vision response has no message content"))
}

/// Parse the model reply into facts, clamping the confidence to 0-100.
pub fn parse_facts(reply: &str) -> Result<NutritionFacts, AppError> {
    let object = extract_json_object(reply)
        .ok_or_else(|| AppError::external("Vision reply contained no JSON object"))?;
    let mut facts: NutritionFacts = serde_json::from_str(object).map_err(|error| {
        AppError::external(format!("Vision reply was not nutrition JSON: {error}"))
    })?;
    facts.confidence = if facts.confidence.is_finite() {
        facts.confidence.clamp(0.0, 100.0)
    } else {
        0.0
    };
    Ok(facts)
}

/// First balanced `{...}` in `text`, ignoring braces inside strings.
pub fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, c) in text[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&text[start..=start + offset]);
                }
            }
            _ => {}
        }
    }
    None
}

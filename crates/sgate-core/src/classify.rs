//! Path/method classification for the public Gemini-compatible surface (§6).

use axum::http::Method;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use sgate_protocol::gemini::GenerateContentRequestBody;

use crate::error::GatewayError;

/// What a `/v1beta/models/{model}` call turned out to be, once the method and
/// the `model:action` suffix (if any) are taken into account.
#[derive(Debug)]
pub enum ModelsSegmentRequest {
    GetModel {
        name: String,
    },
    Generate {
        model: String,
        is_stream: bool,
        body: GenerateContentRequestBody,
    },
}

/// Classifies `GET|POST /v1beta/models/{segment}`, where `segment` is either a
/// bare model name (`GET`) or `model:action` (`POST`).
pub fn classify_models_segment(
    method: &Method,
    segment: &str,
    body: Bytes,
) -> Result<ModelsSegmentRequest, GatewayError> {
    let (model, action) = split_model_action(segment);

    match action {
        None => {
            ensure_method(method, Method::GET, "get model")?;
            Ok(ModelsSegmentRequest::GetModel {
                name: model.to_string(),
            })
        }
        Some("generateContent") => {
            ensure_method(method, Method::POST, "generate content")?;
            let body = parse_json::<GenerateContentRequestBody>(&body, "generate content")?;
            Ok(ModelsSegmentRequest::Generate {
                model: model.to_string(),
                is_stream: false,
                body,
            })
        }
        Some("streamGenerateContent") => {
            ensure_method(method, Method::POST, "stream generate content")?;
            let body = parse_json::<GenerateContentRequestBody>(&body, "stream generate content")?;
            Ok(ModelsSegmentRequest::Generate {
                model: model.to_string(),
                is_stream: true,
                body,
            })
        }
        Some(other) => Err(GatewayError::InvalidRequest(format!(
            "unknown model action {other}"
        ))),
    }
}

fn split_model_action(segment: &str) -> (&str, Option<&str>) {
    match segment.split_once(':') {
        Some((model, action)) => (model, Some(action)),
        None => (segment, None),
    }
}

fn parse_json<T>(body: &[u8], label: &str) -> Result<T, GatewayError>
where
    T: DeserializeOwned,
{
    if body.is_empty() {
        return Err(GatewayError::InvalidRequest(format!(
            "missing body for {label}"
        )));
    }
    serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("invalid json for {label}: {err}")))
}

fn ensure_method(method: &Method, expected: Method, label: &str) -> Result<(), GatewayError> {
    if *method == expected {
        Ok(())
    } else {
        Err(GatewayError::InvalidRequest(format!(
            "invalid method for {label}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_segment_is_a_get_model_request() {
        let result = classify_models_segment(&Method::GET, "gemini-2.5-pro", Bytes::new()).unwrap();
        assert!(matches!(result, ModelsSegmentRequest::GetModel { name } if name == "gemini-2.5-pro"));
    }

    #[test]
    fn colon_action_selects_generate_vs_stream() {
        let body = Bytes::from_static(br#"{"contents":[]}"#);
        let result =
            classify_models_segment(&Method::POST, "gemini-2.5-pro:generateContent", body.clone())
                .unwrap();
        assert!(matches!(
            result,
            ModelsSegmentRequest::Generate { is_stream: false, .. }
        ));

        let result =
            classify_models_segment(&Method::POST, "gemini-2.5-pro:streamGenerateContent", body)
                .unwrap();
        assert!(matches!(
            result,
            ModelsSegmentRequest::Generate { is_stream: true, .. }
        ));
    }

    #[test]
    fn wrong_method_on_get_model_is_rejected() {
        let err =
            classify_models_segment(&Method::POST, "gemini-2.5-pro", Bytes::new()).unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn missing_body_on_generate_is_rejected() {
        let err = classify_models_segment(
            &Method::POST,
            "gemini-2.5-pro:generateContent",
            Bytes::new(),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }

    #[test]
    fn unknown_action_is_rejected() {
        let err = classify_models_segment(
            &Method::POST,
            "gemini-2.5-pro:countTokens",
            Bytes::from_static(b"{}"),
        )
        .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRequest(_)));
    }
}

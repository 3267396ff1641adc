//! HTTP stage client
//!
//! Talks to the four analysis services over multipart form uploads. Each
//! service writes its artifact to the `output_path` it is given and answers
//! with a JSON body naming the result; errors come back as `{"error": ...}`.

use crate::config::StageEndpoints;
use crate::error::Result;
use crate::stage::{
    Classification, DependencyGraph, EmbeddingImage, NormalizedSource, StageClient, StageFailure,
    StageId, StageParams, StageResult,
};
use crate::stages::catalog::{RawFinding, VulnerabilityCatalog};
use async_trait::async_trait;
use reqwest::multipart::{Form, Part};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

#[derive(Debug, Deserialize)]
struct NormalizeResponse {
    normalized_path: String,
}

#[derive(Debug, Deserialize)]
struct PdgResponse {
    pdg_path: String,
}

#[derive(Debug, Deserialize)]
struct ImageResponse {
    image_path: String,
    #[serde(default)]
    placeholder: bool,
}

#[derive(Debug, Deserialize)]
struct PredictResponse {
    is_vulnerable: bool,
    #[serde(default)]
    vulnerabilities: Vec<RawFinding>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct HealthResponse {
    status: String,
}

pub struct HttpStageClient {
    client: reqwest::Client,
    endpoints: StageEndpoints,
    catalog: VulnerabilityCatalog,
}

impl HttpStageClient {
    /// `timeout` bounds each request at the transport level; the worker
    /// bounds each attempt with its own timeout on top.
    pub fn new(endpoints: StageEndpoints, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoints,
            catalog: VulnerabilityCatalog::default(),
        })
    }

    fn url(&self, stage: StageId, route: &str) -> String {
        format!(
            "{}/{}",
            self.endpoints.base_url(stage).trim_end_matches('/'),
            route
        )
    }

    async fn file_part(stage: StageId, path: &Path, file_name: String) -> StageResult<Part> {
        let bytes = tokio::fs::read(path).await.map_err(|e| {
            StageFailure::rejected(stage, format!("Cannot read {}: {}", path.display(), e))
        })?;
        Ok(Part::bytes(bytes).file_name(file_name))
    }

    async fn prepare_output(stage: StageId, output: &Path) -> StageResult<()> {
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StageFailure::internal(
                    stage,
                    format!("Cannot create {}: {}", parent.display(), e),
                )
            })?;
        }
        Ok(())
    }

    async fn post_form<T: DeserializeOwned>(
        &self,
        stage: StageId,
        route: &str,
        form: Form,
    ) -> StageResult<T> {
        let url = self.url(stage, route);
        debug!(stage = %stage, url = %url, "Calling stage service");

        let response = self
            .client
            .post(&url)
            .multipart(form)
            .send()
            .await
            .map_err(|e| StageFailure::unreachable(stage, e.to_string()))?;

        decode(stage, response).await
    }
}

/// Map an HTTP response onto the stage failure taxonomy
async fn decode<T: DeserializeOwned>(stage: StageId, response: reqwest::Response) -> StageResult<T> {
    let status = response.status();
    let body = response
        .text()
        .await
        .map_err(|e| StageFailure::unreachable(stage, e.to_string()))?;

    if status.is_success() {
        return serde_json::from_str(&body).map_err(|e| {
            StageFailure::internal(stage, format!("Undecodable response: {}", e))
        });
    }

    let message = serde_json::from_str::<ErrorBody>(&body)
        .map(|b| b.error)
        .unwrap_or_else(|_| format!("HTTP {}: {}", status.as_u16(), body.trim()));

    if status.is_client_error() {
        Err(StageFailure::rejected(stage, message))
    } else {
        Err(StageFailure::internal(stage, message))
    }
}

fn display_name(path: &Path, fallback: &str) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| fallback.to_string())
}

#[async_trait]
impl StageClient for HttpStageClient {
    async fn normalize(&self, source: &Path, params: &StageParams) -> StageResult<NormalizedSource> {
        let stage = StageId::Normalize;
        let output = params.artifact_path(stage, "");
        Self::prepare_output(stage, &output).await?;

        let form = Form::new()
            .part(
                "file",
                Self::file_part(stage, source, params.file_name.clone()).await?,
            )
            .text("output_path", output.to_string_lossy().into_owned());

        let body: NormalizeResponse = self.post_form(stage, "normalize", form).await?;
        Ok(NormalizedSource {
            path: PathBuf::from(body.normalized_path),
        })
    }

    async fn extract_graph(
        &self,
        normalized: &NormalizedSource,
        params: &StageParams,
    ) -> StageResult<DependencyGraph> {
        let stage = StageId::ExtractGraph;
        let output = params.artifact_path(stage, ".dot");
        Self::prepare_output(stage, &output).await?;

        let name = display_name(&normalized.path, &params.file_name);
        let form = Form::new()
            .part("file", Self::file_part(stage, &normalized.path, name).await?)
            .text("output_path", output.to_string_lossy().into_owned());

        let body: PdgResponse = self.post_form(stage, "generate_pdg", form).await?;
        let data = tokio::fs::read_to_string(&body.pdg_path).await.map_err(|e| {
            StageFailure::internal(stage, format!("Cannot read graph {}: {}", body.pdg_path, e))
        })?;

        Ok(DependencyGraph { data })
    }

    async fn build_image(
        &self,
        graph: &DependencyGraph,
        params: &StageParams,
    ) -> StageResult<EmbeddingImage> {
        let stage = StageId::BuildImage;
        let output = params.artifact_path(stage, ".pkl");
        Self::prepare_output(stage, &output).await?;

        let graph_name = format!("{}-{}.dot", params.file_id, params.file_name);
        let form = Form::new()
            .part(
                "pdg_file",
                Part::bytes(graph.data.clone().into_bytes()).file_name(graph_name),
            )
            .text("output_path", output.to_string_lossy().into_owned());

        let body: ImageResponse = self.post_form(stage, "generate_image", form).await?;
        Ok(EmbeddingImage {
            path: PathBuf::from(body.image_path),
            placeholder: body.placeholder,
        })
    }

    async fn classify(
        &self,
        image: &EmbeddingImage,
        params: &StageParams,
    ) -> StageResult<Classification> {
        let stage = StageId::Classify;
        let name = display_name(&image.path, "image.pkl");
        let form = Form::new()
            .part("image_file", Self::file_part(stage, &image.path, name).await?)
            .text("file_id", params.file_id.to_string());

        let body: PredictResponse = self.post_form(stage, "predict", form).await?;
        if !body.is_vulnerable {
            return Ok(Classification::clean());
        }

        let findings = body
            .vulnerabilities
            .into_iter()
            .map(|raw| self.catalog.complete(raw))
            .collect();
        Ok(Classification::vulnerable(findings))
    }

    async fn health(&self, stage: StageId) -> StageResult<()> {
        let url = self.url(stage, "health");
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| StageFailure::unreachable(stage, e.to_string()))?;

        if response.status() != StatusCode::OK {
            return Err(StageFailure::internal(
                stage,
                format!("Health check returned HTTP {}", response.status().as_u16()),
            ));
        }

        let body: HealthResponse = decode(stage, response).await?;
        if body.status == "ok" {
            Ok(())
        } else {
            Err(StageFailure::internal(stage, body.status))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageFailureKind;
    use chrono::Utc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use uuid::Uuid;
    use vulscan_storage::FileRecord;

    /// Answers every connection with the same status line and JSON body
    async fn stub_service(status: &'static str, body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                read_request(&mut socket).await;
                let response = format!(
                    "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
            }
        });

        format!("http://{}", addr)
    }

    /// Consume the head and a `Content-Length` body
    async fn read_request(socket: &mut tokio::net::TcpStream) {
        let mut seen = Vec::new();
        let mut buf = [0u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            seen.extend_from_slice(&buf[..n]);
            if let Some(pos) = seen.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };

        let head = String::from_utf8_lossy(&seen[..head_end]).to_ascii_lowercase();
        let length = head
            .lines()
            .find_map(|line| line.strip_prefix("content-length:"))
            .and_then(|v| v.trim().parse::<usize>().ok())
            .unwrap_or(0);

        let mut have = seen.len() - head_end;
        while have < length {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return;
            }
            have += n;
        }
    }

    async fn decode_from(status: &'static str, body: &'static str) -> StageResult<NormalizeResponse> {
        let url = stub_service(status, body).await;
        let response = reqwest::Client::new().get(&url).send().await.unwrap();
        decode(StageId::Normalize, response).await
    }

    fn client_for(stage: StageId, url: &str) -> HttpStageClient {
        let mut endpoints = StageEndpoints::default();
        match stage {
            StageId::Normalize => endpoints.normalize = url.to_string(),
            StageId::ExtractGraph => endpoints.extract_graph = url.to_string(),
            StageId::BuildImage => endpoints.build_image = url.to_string(),
            StageId::Classify => endpoints.classify = url.to_string(),
        }
        HttpStageClient::new(endpoints, Duration::from_secs(5)).unwrap()
    }

    fn params_in(work_dir: &Path) -> StageParams {
        let file = FileRecord {
            id: Uuid::new_v4(),
            project_id: "p".to_string(),
            filename: "main.c".to_string(),
            storage_path: work_dir.join("main.c"),
            size: 16,
            content_type: "text/x-c".to_string(),
            uploaded_at: Utc::now(),
        };
        StageParams::new(Uuid::new_v4(), &file, work_dir)
    }

    #[tokio::test]
    async fn test_decode_success_body() {
        let body = decode_from("200 OK", r#"{"normalized_path":"/work/main.c"}"#)
            .await
            .unwrap();
        assert_eq!(body.normalized_path, "/work/main.c");
    }

    #[tokio::test]
    async fn test_decode_client_error_is_rejected() {
        let failure = decode_from("400 Bad Request", r#"{"error":"File type not supported"}"#)
            .await
            .unwrap_err();

        assert_eq!(failure.kind, StageFailureKind::RejectedInput);
        assert_eq!(failure.stage, StageId::Normalize);
        assert_eq!(failure.message, "File type not supported");
    }

    #[tokio::test]
    async fn test_decode_server_error_is_internal() {
        let failure = decode_from("500 Internal Server Error", r#"{"error":"joern crashed"}"#)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::InternalError);
        assert_eq!(failure.message, "joern crashed");

        // No `error` field: status and raw body are reported
        let failure = decode_from("503 Service Unavailable", "overloaded")
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::InternalError);
        assert_eq!(failure.message, "HTTP 503: overloaded");
    }

    #[tokio::test]
    async fn test_decode_malformed_success_is_internal() {
        let failure = decode_from("200 OK", r#"{"unexpected":true}"#)
            .await
            .unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::InternalError);
        assert!(failure.message.starts_with("Undecodable response"));

        let failure = decode_from("200 OK", "<html>").await.unwrap_err();
        assert_eq!(failure.kind, StageFailureKind::InternalError);
    }

    #[tokio::test]
    async fn test_normalize_rejected_by_service() {
        let work = tempfile::tempdir().unwrap();
        let params = params_in(work.path());
        std::fs::write(work.path().join("main.c"), "int main(void) {}").unwrap();

        let url = stub_service("400 Bad Request", r#"{"error":"File type not supported"}"#).await;
        let failure = client_for(StageId::Normalize, &url)
            .normalize(&work.path().join("main.c"), &params)
            .await
            .unwrap_err();

        assert_eq!(failure.kind, StageFailureKind::RejectedInput);
        assert_eq!(failure.message, "File type not supported");
    }

    #[tokio::test]
    async fn test_classify_completes_findings_from_catalog() {
        let work = tempfile::tempdir().unwrap();
        let params = params_in(work.path());
        let image_path = work.path().join("main.pkl");
        std::fs::write(&image_path, b"\x80\x04").unwrap();

        let url = stub_service(
            "200 OK",
            r#"{"is_vulnerable":true,"vulnerabilities":[{"type":"buffer_overflow","function_name":"copy","line_number":12}]}"#,
        )
        .await;
        let classification = client_for(StageId::Classify, &url)
            .classify(
                &EmbeddingImage {
                    path: image_path,
                    placeholder: false,
                },
                &params,
            )
            .await
            .unwrap();

        assert!(classification.is_vulnerable);
        assert_eq!(classification.findings.len(), 1);
        let finding = &classification.findings[0];
        assert_eq!(finding.vulnerability_type, "Buffer Overflow");
        assert_eq!(finding.cwe_id, "CWE-119");
        assert_eq!(finding.function_name, "copy");
        assert_eq!(finding.line_number, 12);
    }

    #[tokio::test]
    async fn test_health_ok() {
        let url = stub_service("200 OK", r#"{"status":"ok"}"#).await;
        assert!(client_for(StageId::BuildImage, &url)
            .health(StageId::BuildImage)
            .await
            .is_ok());
    }

    #[test]
    fn test_url_joins_route() {
        let mut endpoints = StageEndpoints::default();
        endpoints.normalize = "http://localhost:5001/".to_string();
        let client = HttpStageClient::new(endpoints, Duration::from_secs(1)).unwrap();

        assert_eq!(
            client.url(StageId::Normalize, "normalize"),
            "http://localhost:5001/normalize"
        );
        assert_eq!(
            client.url(StageId::Classify, "predict"),
            "http://prediction:5004/predict"
        );
    }

    #[test]
    fn test_display_name_fallback() {
        assert_eq!(display_name(Path::new("/a/b/x.c"), "y"), "x.c");
        assert_eq!(display_name(Path::new("/"), "y"), "y");
    }

    #[tokio::test]
    async fn test_missing_input_is_rejected() {
        let failure = HttpStageClient::file_part(
            StageId::Normalize,
            Path::new("/nonexistent/vulscan/input.c"),
            "input.c".to_string(),
        )
        .await
        .unwrap_err();

        assert_eq!(failure.kind, crate::stage::StageFailureKind::RejectedInput);
    }

    #[tokio::test]
    async fn test_unreachable_service() {
        let mut endpoints = StageEndpoints::default();
        // Reserved port; nothing listens there
        endpoints.normalize = "http://127.0.0.1:9".to_string();
        let client = HttpStageClient::new(endpoints, Duration::from_millis(500)).unwrap();

        let failure = client.health(StageId::Normalize).await.unwrap_err();
        assert_eq!(failure.kind, crate::stage::StageFailureKind::Unreachable);
    }
}

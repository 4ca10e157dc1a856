//! Etherscan-compatible explorer API (Etherscan, Arbiscan, Optimistic Etherscan).

use std::{path::Path, time::Duration};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use url::Url;

use super::{JobStatus, ServiceError, Submission, VerificationRequest, VerificationService};

/// Default timeout for explorer requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct EtherscanResponse {
    status: String,
    message: String,
    result: String,
}

/// The parts of a Hardhat build-info file the explorer needs.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BuildInfo {
    solc_long_version: String,
    input: Value,
}

/// Client for the `verifysourcecode` / `checkverifystatus` endpoints.
#[derive(Debug, Clone)]
pub struct EtherscanClient {
    client: reqwest::Client,
    api_url: Url,
    api_key: String,
}

impl EtherscanClient {
    pub fn new(api_url: Url, api_key: impl Into<String>) -> Result<Self, anyhow::Error> {
        let client = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self {
            client,
            api_url,
            api_key: api_key.into(),
        })
    }

    async fn post(&self, form: &[(&str, &str)]) -> Result<EtherscanResponse, ServiceError> {
        let response = self
            .client
            .post(self.api_url.clone())
            .form(form)
            .send()
            .await
            .map_err(|e| ServiceError::Transient(e.to_string()))?;

        let status = response.status();
        if status.as_u16() == 429 {
            return Err(ServiceError::RateLimited(format!("HTTP {status}")));
        }
        if status.is_server_error() {
            return Err(ServiceError::Transient(format!("HTTP {status}")));
        }
        if !status.is_success() {
            return Err(ServiceError::Rejected(format!("HTTP {status}")));
        }

        response
            .json()
            .await
            .map_err(|e| ServiceError::Transient(format!("malformed explorer response: {e}")))
    }
}

fn load_build_info(path: &Path) -> Result<BuildInfo, anyhow::Error> {
    let content = std::fs::read_to_string(path)
        .context(format!("Failed to read build info {}", path.display()))?;
    serde_json::from_str(&content).context(format!("Failed to parse build info {}", path.display()))
}

/// Classify a response message shared by both endpoints.
fn classify_common(response: &EtherscanResponse) -> Option<ServiceError> {
    let result = response.result.to_lowercase();
    if result.contains("rate limit") {
        Some(ServiceError::RateLimited(response.result.clone()))
    } else if result.contains("unable to locate contractcode") {
        // The explorer has not indexed the contract yet.
        Some(ServiceError::Transient(response.result.clone()))
    } else if result.contains("invalid api key") || result.contains("missing/invalid api key") {
        Some(ServiceError::Rejected(response.result.clone()))
    } else {
        None
    }
}

fn parse_submission(response: EtherscanResponse) -> Result<Submission, ServiceError> {
    if response.result.to_lowercase().contains("already verified") {
        return Ok(Submission::AlreadyVerified);
    }
    if let Some(error) = classify_common(&response) {
        return Err(error);
    }
    if response.status == "1" {
        return Ok(Submission::Queued(response.result));
    }
    Err(ServiceError::Rejected(format!(
        "{}: {}",
        response.message, response.result
    )))
}

fn parse_status(response: EtherscanResponse) -> Result<JobStatus, ServiceError> {
    let result = response.result.to_lowercase();
    if result.contains("pending in queue") {
        Ok(JobStatus::Pending)
    } else if result.contains("pass - verified") || result.contains("already verified") {
        Ok(JobStatus::Verified)
    } else if let Some(error) = classify_common(&response) {
        Err(error)
    } else if result.starts_with("fail") {
        Ok(JobStatus::Failed(response.result))
    } else {
        Err(ServiceError::Transient(format!(
            "unexpected status {}: {}",
            response.message, response.result
        )))
    }
}

impl VerificationService for EtherscanClient {
    async fn submit_verification(
        &self,
        request: &VerificationRequest,
    ) -> Result<Submission, ServiceError> {
        let build_info_path = request.source.build_info.as_deref().ok_or_else(|| {
            ServiceError::Rejected(format!(
                "no build info for {}",
                request.source.fully_qualified_name()
            ))
        })?;
        let build_info =
            load_build_info(build_info_path).map_err(|e| ServiceError::Rejected(format!("{e:#}")))?;

        let source_code = build_info.input.to_string();
        let address = request.address.to_string();
        let contract_name = request.source.fully_qualified_name();
        let compiler_version = format!("v{}", build_info.solc_long_version);
        let constructor_args = hex::encode(&request.constructor_args);

        let form = [
            ("apikey", self.api_key.as_str()),
            ("module", "contract"),
            ("action", "verifysourcecode"),
            ("contractaddress", address.as_str()),
            ("sourceCode", source_code.as_str()),
            ("codeformat", "solidity-standard-json-input"),
            ("contractname", contract_name.as_str()),
            ("compilerversion", compiler_version.as_str()),
            // The misspelling is part of the explorer API.
            ("constructorArguements", constructor_args.as_str()),
        ];

        let response = self.post(&form).await?;
        tracing::debug!(
            contract = %contract_name,
            status = %response.status,
            result = %response.result,
            "Verification submission answered"
        );
        parse_submission(response)
    }

    async fn get_verification_status(&self, job: &str) -> Result<JobStatus, ServiceError> {
        let form = [
            ("apikey", self.api_key.as_str()),
            ("module", "contract"),
            ("action", "checkverifystatus"),
            ("guid", job),
        ];

        let response = self.post(&form).await?;
        parse_status(response)
    }
}

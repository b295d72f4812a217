use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use once_cell::sync::OnceCell;
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use serde_json::Value;

use crate::wire::parse_rows_json;

const REQUEST_TIMEOUT_SECS: u64 = 10;

static CLIENT: OnceCell<Client> = OnceCell::new();

pub fn http_client() -> Result<&'static Client> {
    CLIENT.get_or_try_init(|| {
        Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .context("failed to build http client")
    })
}

/// GET a PostgREST endpoint with the project key and return the decoded rows.
pub fn fetch_rows(url: &str, api_key: &str, query: &[(&str, String)]) -> Result<Vec<Value>> {
    parse_rows_json(&fetch_body(url, api_key, query)?)
}

pub fn fetch_body(url: &str, api_key: &str, query: &[(&str, String)]) -> Result<String> {
    let client = http_client()?;
    let resp = client
        .get(url)
        .query(query)
        .header(USER_AGENT, concat!("livescore-sync/", env!("CARGO_PKG_VERSION")))
        .header(ACCEPT, "application/json")
        .header("apikey", api_key)
        .header(AUTHORIZATION, format!("Bearer {api_key}"))
        .send()
        .context("request failed")?;
    let status = resp.status();
    let body = resp.text().context("failed reading body")?;
    if !status.is_success() {
        return Err(anyhow!("http {}: {}", status, body.trim()));
    }
    Ok(body)
}

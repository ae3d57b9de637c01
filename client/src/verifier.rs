//! Checks that a contract the bot asks us to co-deploy is the audited one.

use crate::{Error, Result};
use commonware_cryptography::{
    sha256::{Digest, Sha256},
    Hasher,
};
use commonware_utils::from_hex;
use futures::{future::BoxFuture, FutureExt};
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;
use url::Url;

pub trait BytecodeVerifier: Send + Sync {
    /// Whether `code` is the expected contract bytecode.
    fn verify<'a>(&'a self, code: &'a [u8]) -> BoxFuture<'a, Result<bool>>;
}

/// Compares the sha256 of the deployed bytecode with a pinned digest.
#[derive(Clone, Debug)]
pub struct DigestVerifier {
    expected: Digest,
}

impl DigestVerifier {
    pub fn new(expected: Digest) -> Self {
        Self { expected }
    }

    pub fn for_code(code: &[u8]) -> Self {
        Self::new(digest(code))
    }
}

fn digest(code: &[u8]) -> Digest {
    let mut hasher = Sha256::new();
    hasher.update(code);
    hasher.finalize()
}

impl BytecodeVerifier for DigestVerifier {
    fn verify<'a>(&'a self, code: &'a [u8]) -> BoxFuture<'a, Result<bool>> {
        let matches = digest(code) == self.expected;
        async move { Ok(matches) }.boxed()
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompileRequest {
    pub source: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CompileResponse {
    /// Hex encoded bytecode.
    pub bytecode: String,
}

/// Compiles the contract source with a remote compiler and compares bytecode.
///
/// The compiled bytecode is fetched once and reused for every later check.
#[derive(Debug)]
pub struct CompilerVerifier {
    http: reqwest::Client,
    compile_url: Url,
    source: String,
    compiled: OnceCell<Vec<u8>>,
}

impl CompilerVerifier {
    pub fn new(compiler_url: &str, source: impl Into<String>) -> Result<Self> {
        let base = Url::parse(compiler_url)?;
        match base.scheme() {
            "http" | "https" => {}
            other => return Err(Error::InvalidScheme(other.to_string())),
        }
        Ok(Self {
            http: reqwest::Client::new(),
            compile_url: base.join("compile")?,
            source: source.into(),
            compiled: OnceCell::new(),
        })
    }

    async fn compile(&self) -> Result<Vec<u8>> {
        debug!(url = %self.compile_url, "compiling contract source");
        let response = self
            .http
            .post(self.compile_url.clone())
            .json(&CompileRequest {
                source: self.source.clone(),
            })
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Error::FailedWithBody { status, body });
        }
        let CompileResponse { bytecode } = response.json().await?;
        from_hex(&bytecode).ok_or(Error::UnexpectedResponse)
    }
}

impl BytecodeVerifier for CompilerVerifier {
    fn verify<'a>(&'a self, code: &'a [u8]) -> BoxFuture<'a, Result<bool>> {
        async move {
            let expected = self.compiled.get_or_try_init(|| self.compile()).await?;
            Ok(expected.as_slice() == code)
        }
        .boxed()
    }
}

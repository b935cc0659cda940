//! A small blocking HTTP client for the peer snapshot-download API, plus
//! the bounded-retry helper every call site wraps itself in.
//!
//! The peer surface is narrow: GET on a directory returns a
//! newline-separated list of basenames, HEAD on a file returns
//! `Content-Length` and `Content-MD5`, and GET on a file streams the
//! bytes.  All three share one token-bearing URL shape (see
//! `download_url`).
use std::path::Path;
use std::time::Duration;

use percent_encoding::utf8_percent_encode;
use percent_encoding::AsciiSet;
use percent_encoding::CONTROLS;

use crate::chain_error;
use crate::chain_warn;
use crate::fresh_error;
use crate::remote_fs::NetworkAddress;
use crate::result::Result;

/// Characters escaped in the `file=` query value.  Forward slashes stay
/// verbatim: the peer matches the value against real filesystem paths.
const FILE_PARAM_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'&')
    .add(b'+')
    .add(b'<')
    .add(b'>')
    .add(b'?');

/// Add up to this fraction of the base delay to our sleep duration when
/// backing off before retrying a failed call.
const RETRY_JITTER_FRAC: f64 = 0.5;

/// Returns the peer API url for `file` on `addr`, without the optional
/// `channel` / `acquire_md5` parameters.
pub fn download_url(addr: &NetworkAddress, token: &str, file: &str) -> String {
    format!(
        "http://{}/api/_tablet/_download?token={}&file={}",
        addr,
        token,
        utf8_percent_encode(file, FILE_PARAM_ESCAPE)
    )
}

/// One blocking HTTP exchange with a peer node.
///
/// The client is re-`init`-ed for each request; HEAD responses cache the
/// length and md5 headers for the `get_content_*` accessors.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::blocking::Client,
    url: String,
    timeout: Option<Duration>,
    content_length: Option<u64>,
    content_md5: Option<String>,
}

impl HttpClient {
    pub fn new() -> Result<HttpClient> {
        // One shared connection pool for all exchanges in the process.
        // Peer addresses are cluster-internal, so proxies never apply.
        lazy_static::lazy_static! {
            static ref SHARED: std::result::Result<reqwest::blocking::Client, reqwest::Error> =
                reqwest::blocking::Client::builder().no_proxy().build();
        }

        let client = SHARED
            .as_ref()
            .map_err(|e| chain_error!(e, "failed to construct http client"))?
            .clone();
        Ok(HttpClient {
            client,
            url: String::new(),
            timeout: None,
            content_length: None,
            content_md5: None,
        })
    }

    /// Points the client at `url` and clears any cached response state.
    pub fn init(&mut self, url: &str) -> Result<()> {
        self.url = url.to_owned();
        self.timeout = None;
        self.content_length = None;
        self.content_md5 = None;
        Ok(())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    fn apply_timeout(&self, request: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        match self.timeout {
            Some(timeout) => request.timeout(timeout),
            None => request,
        }
    }

    /// Issues a HEAD request and caches `Content-Length` / `Content-MD5`.
    pub fn head(&mut self) -> Result<()> {
        let response = self
            .apply_timeout(self.client.head(&self.url))
            .send()
            .map_err(|e| chain_warn!(e, "head request failed", url=%self.url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fresh_error!("head request rejected", url=%self.url, code=%status));
        }

        self.content_length = match response.headers().get(reqwest::header::CONTENT_LENGTH) {
            Some(value) => Some(
                value
                    .to_str()
                    .ok()
                    .and_then(|s| s.parse::<u64>().ok())
                    .ok_or_else(
                        || fresh_error!("unparseable content-length header", url=%self.url),
                    )?,
            ),
            None => None,
        };
        // Old peers don't advertise a md5; callers treat "" as unknown.
        self.content_md5 = Some(
            response
                .headers()
                .get("content-md5")
                .and_then(|value| value.to_str().ok())
                .unwrap_or("")
                .to_owned(),
        );
        Ok(())
    }

    /// The `Content-Length` of the last HEAD response.
    pub fn get_content_length(&self) -> Result<u64> {
        self.content_length
            .ok_or_else(|| fresh_error!("no content-length cached", url=%self.url))
    }

    /// The `Content-MD5` of the last HEAD response; empty when the peer
    /// did not advertise one.
    pub fn get_content_md5(&self) -> Result<String> {
        self.content_md5
            .clone()
            .ok_or_else(|| fresh_error!("no content-md5 cached", url=%self.url))
    }

    /// Issues a GET request and returns the response body as text.
    pub fn execute(&mut self) -> Result<String> {
        let response = self
            .apply_timeout(self.client.get(&self.url))
            .send()
            .map_err(|e| chain_warn!(e, "get request failed", url=%self.url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fresh_error!("get request rejected", url=%self.url, code=%status));
        }

        response
            .text()
            .map_err(|e| chain_error!(e, "failed to read response body", url=%self.url))
    }

    /// Issues a GET request and streams the response body to
    /// `local_path`, creating or truncating it.
    pub fn download(&mut self, local_path: &Path) -> Result<()> {
        let mut response = self
            .apply_timeout(self.client.get(&self.url))
            .send()
            .map_err(|e| chain_warn!(e, "download request failed", url=%self.url))?;
        let status = response.status();
        if !status.is_success() {
            return Err(fresh_error!("download request rejected", url=%self.url, code=%status));
        }

        let mut file = std::fs::File::create(local_path)
            .map_err(|e| chain_error!(e, "failed to create download target", ?local_path))?;
        response
            .copy_to(&mut file)
            .map_err(|e| chain_error!(e, "failed to stream response body", url=%self.url))?;
        Ok(())
    }

    /// Runs `callback` with a fresh client, retrying up to `attempts`
    /// times with a jittered `base_interval`-second sleep in between.
    pub fn execute_with_retry(
        attempts: u32,
        base_interval_secs: u64,
        mut callback: impl FnMut(&mut HttpClient) -> Result<()>,
    ) -> Result<()> {
        use rand::Rng;

        let mut rng = rand::thread_rng();
        let mut last_error = None;
        for attempt in 0..attempts {
            if attempt > 0 {
                let jitter = rng.gen_range(1.0..1.0 + RETRY_JITTER_FRAC);
                std::thread::sleep(Duration::from_secs(base_interval_secs).mul_f64(jitter));
            }

            let mut client = HttpClient::new()?;
            match callback(&mut client) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::info!(attempt, error=%e, "retrying http exchange");
                    last_error = Some(e);
                }
            }
        }

        let last_error = match last_error {
            Some(e) => e,
            None => return Err(fresh_error!("http retry invoked with zero attempts")),
        };
        Err(chain_warn!(last_error, "reached http retry limit", attempts))
    }
}

#[test]
fn test_download_url_escapes_query_value() {
    let addr = NetworkAddress {
        hostname: "172.16.0.14".to_owned(),
        port: 6781,
    };

    let url = download_url(&addr, "e804dd27", "/storage/snapshot/20230410/10007/123");
    assert_eq!(
        url,
        "http://172.16.0.14:6781/api/_tablet/_download?token=e804dd27\
         &file=/storage/snapshot/20230410/10007/123"
    );

    // Query metacharacters in the path cannot break out of the value.
    let tricky = download_url(&addr, "tok", "/a b&c");
    assert_eq!(
        tricky,
        "http://172.16.0.14:6781/api/_tablet/_download?token=tok&file=/a%20b%26c"
    );
}

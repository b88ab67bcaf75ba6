//! HTTP 宿主模块
//!
//! 动作脚本可调用的阻塞式 HTTP 函数，结果以 `#{status, body}` 返回：
//!
//! ```text
//! let resp = http_get("http://notify/ping");
//! let resp = http_get(url, #{ "x-device": event.device_id });
//! let resp = http_post(url, #{}, "raw body");
//! let resp = http_post(url, #{}, #{ alert: true });   // 对象以 JSON 发送
//! ```
//!
//! 每次请求的超时取配置上限与本次脚本剩余执行时间中的较小值。

use super::host::{HostCall, HostModule};
use super::Capabilities;
use parking_lot::Mutex;
use reqwest::Method;
use reqwest::blocking::Client;
use reqwest::header::CONTENT_TYPE;
use rhai::{Dynamic, Engine, EvalAltResult, Map};
use std::io::Read;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// 脚本 HTTP 函数模块
pub struct HttpModule {
    client: Arc<HttpClient>,
}

struct HttpClient {
    /// 首次请求时在执行脚本的阻塞线程上创建
    inner: Mutex<Option<Client>>,
    timeout: Duration,
    use_proxy: bool,
}

/// 单次请求的参数
struct HttpRequest<'a> {
    method: Method,
    url: &'a str,
    headers: Map,
    body: Option<String>,
}

impl HttpModule {
    /// `timeout` 为单个请求的超时上限
    pub fn new(timeout: Duration) -> Self {
        Self {
            client: Arc::new(HttpClient {
                inner: Mutex::new(None),
                timeout,
                use_proxy: true,
            }),
        }
    }

    /// 直连目标地址，不读取系统代理配置
    pub fn without_proxy(self) -> Self {
        let timeout = self.client.timeout;
        Self {
            client: Arc::new(HttpClient {
                inner: Mutex::new(None),
                timeout,
                use_proxy: false,
            }),
        }
    }
}

impl HttpClient {
    fn client(&self) -> reqwest::Result<Client> {
        let mut slot = self.inner.lock();
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let mut builder = Client::builder();
        if !self.use_proxy {
            builder = builder.no_proxy();
        }
        let client = builder.build()?;
        *slot = Some(client.clone());
        Ok(client)
    }

    fn send(
        &self,
        request: HttpRequest<'_>,
        deadline: Instant,
        max_body: usize,
    ) -> Result<Map, Box<EvalAltResult>> {
        let HttpRequest {
            method,
            url,
            headers,
            body,
        } = request;

        let timeout = deadline
            .saturating_duration_since(Instant::now())
            .min(self.timeout);
        if timeout.is_zero() {
            return Err(format!("{} {}: 脚本执行时间已耗尽", method, url).into());
        }

        let client = self
            .client()
            .map_err(|e| format!("HTTP 客户端初始化失败: {}", e))?;

        let mut builder = client.request(method.clone(), url).timeout(timeout);
        for (name, value) in &headers {
            builder = builder.header(name.as_str(), value.to_string());
        }
        if let Some(body) = body {
            builder = builder.body(body);
        }

        let started = Instant::now();
        let response = builder.send().map_err(|e| {
            warn!(%method, url, error = %e, "HTTP 请求失败");
            format!("{} {} 请求失败: {}", method, url, e)
        })?;
        let status = response.status().as_u16();

        // 多读一个字节用于判断是否超限
        let limit = if max_body > 0 {
            max_body as u64 + 1
        } else {
            u64::MAX
        };
        let mut raw = Vec::new();
        response
            .take(limit)
            .read_to_end(&mut raw)
            .map_err(|e| format!("{} {} 读取响应失败: {}", method, url, e))?;
        if max_body > 0 && raw.len() > max_body {
            return Err(format!("{} {}: 响应体超过上限 {} 字节", method, url, max_body).into());
        }

        debug!(
            %method,
            url,
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "HTTP 请求完成"
        );

        let mut result = Map::new();
        result.insert("status".into(), (status as rhai::INT).into());
        result.insert(
            "body".into(),
            String::from_utf8_lossy(&raw).into_owned().into(),
        );
        Ok(result)
    }
}

impl HostModule for HttpModule {
    fn name(&self) -> &'static str {
        "http"
    }

    fn capabilities(&self) -> Capabilities {
        Capabilities::SideEffects
    }

    fn register(&self, engine: &mut Engine, call: &HostCall<'_>) {
        let deadline = call.deadline;
        let max_body = call.limits.max_string_size;

        let client = self.client.clone();
        engine.register_fn("http_get", move |url: &str| {
            let request = HttpRequest {
                method: Method::GET,
                url,
                headers: Map::new(),
                body: None,
            };
            client.send(request, deadline, max_body)
        });

        let client = self.client.clone();
        engine.register_fn("http_get", move |url: &str, headers: Map| {
            let request = HttpRequest {
                method: Method::GET,
                url,
                headers,
                body: None,
            };
            client.send(request, deadline, max_body)
        });

        let client = self.client.clone();
        engine.register_fn("http_post", move |url: &str, headers: Map, body: &str| {
            let request = HttpRequest {
                method: Method::POST,
                url,
                headers,
                body: Some(body.to_string()),
            };
            client.send(request, deadline, max_body)
        });

        let client = self.client.clone();
        engine.register_fn(
            "http_post",
            move |url: &str, mut headers: Map, body: Map| -> Result<Map, Box<EvalAltResult>> {
                let json = serde_json::to_string(&Dynamic::from_map(body))
                    .map_err(|e| format!("请求体无法序列化为 JSON: {}", e))?;
                if !headers
                    .keys()
                    .any(|k| k.eq_ignore_ascii_case(CONTENT_TYPE.as_str()))
                {
                    headers.insert(CONTENT_TYPE.as_str().into(), "application/json".into());
                }
                let request = HttpRequest {
                    method: Method::POST,
                    url,
                    headers,
                    body: Some(json),
                };
                client.send(request, deadline, max_body)
            },
        );
    }
}

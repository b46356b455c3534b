use ants_core::error::AntError;
use ants_core::types::TaskMethod;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use reqwest::Method;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

const JSON_CONTENT_TYPE: &str = "application/json";

/// Request body for one HTTP task method. Task variables become form
/// fields or a flat JSON object of strings.
#[derive(Debug, Clone, PartialEq)]
pub enum HttpRequest {
    Get,
    PostForm(BTreeMap<String, String>),
    PostJson(Vec<u8>),
    PutJson(Vec<u8>),
    Delete(Vec<u8>),
}

impl HttpRequest {
    pub fn for_method(
        method: TaskMethod,
        vars: &HashMap<String, String>,
    ) -> Result<Self, AntError> {
        let params: BTreeMap<String, String> =
            vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
        Ok(match method {
            TaskMethod::HttpGet => HttpRequest::Get,
            TaskMethod::HttpPostForm => HttpRequest::PostForm(params),
            TaskMethod::HttpPostJson => HttpRequest::PostJson(serde_json::to_vec(&params)?),
            TaskMethod::HttpPutJson => HttpRequest::PutJson(serde_json::to_vec(&params)?),
            TaskMethod::HttpDelete => HttpRequest::Delete(serde_json::to_vec(&params)?),
            other => {
                return Err(AntError::UnsupportedMethod(format!(
                    "unsupported http protocol {}",
                    other
                )))
            }
        })
    }

    fn method(&self) -> Method {
        match self {
            HttpRequest::Get => Method::GET,
            HttpRequest::PostForm(_) | HttpRequest::PostJson(_) => Method::POST,
            HttpRequest::PutJson(_) => Method::PUT,
            HttpRequest::Delete(_) => Method::DELETE,
        }
    }

    fn is_json(&self) -> bool {
        matches!(self, HttpRequest::PostJson(_) | HttpRequest::PutJson(_))
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Vec<u8>,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Shared `reqwest` client that sends the ant's user agent.
#[derive(Clone)]
pub struct HttpClient {
    client: reqwest::Client,
}

impl HttpClient {
    pub fn new(user_agent: &str) -> Result<Self, AntError> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|e| AntError::Http(format!("failed to create http client: {}", e)))?;
        Ok(Self { client })
    }

    /// Sends one request. Any status is returned as a response; only
    /// transport failures are errors.
    pub async fn send(
        &self,
        url: &str,
        headers: &HashMap<String, String>,
        query: &HashMap<String, String>,
        request: &HttpRequest,
    ) -> Result<HttpResponse, AntError> {
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| AntError::Http(format!("invalid header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| AntError::Http(format!("invalid header value for {}: {}", name, e)))?;
            header_map.insert(name, value);
        }
        if request.is_json() && !header_map.contains_key(CONTENT_TYPE) {
            header_map.insert(CONTENT_TYPE, HeaderValue::from_static(JSON_CONTENT_TYPE));
        }
        let mut params: Vec<(&String, &String)> = query.iter().collect();
        params.sort();

        let mut builder = self
            .client
            .request(request.method(), url)
            .headers(header_map)
            .query(&params);
        builder = match request {
            HttpRequest::Get => builder,
            HttpRequest::PostForm(form) => builder.form(form),
            HttpRequest::PostJson(body) | HttpRequest::PutJson(body) | HttpRequest::Delete(body) => {
                builder.body(body.clone())
            }
        };

        let response = builder
            .send()
            .await
            .map_err(|e| AntError::Http(format!("request for {} failed due to {}", url, e)))?;
        let status = response.status().as_u16();
        let body = response
            .bytes()
            .await
            .map_err(|e| AntError::Http(format!("failed to read response of {}: {}", url, e)))?
            .to_vec();
        debug!("{} {} returned status={} bytes={}", request.method(), url, status, body.len());
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_for_method() {
        let vars = HashMap::from([("name".to_string(), "ant".to_string())]);
        assert_eq!(
            HttpRequest::for_method(TaskMethod::HttpGet, &vars).unwrap(),
            HttpRequest::Get
        );
        assert_eq!(
            HttpRequest::for_method(TaskMethod::HttpPostJson, &vars).unwrap(),
            HttpRequest::PostJson(br#"{"name":"ant"}"#.to_vec())
        );
        match HttpRequest::for_method(TaskMethod::HttpPostForm, &vars).unwrap() {
            HttpRequest::PostForm(form) => assert_eq!(form["name"], "ant"),
            other => panic!("unexpected request {:?}", other),
        }
        assert_eq!(HttpRequest::PutJson(Vec::new()).method(), Method::PUT);
        assert_eq!(HttpRequest::Delete(Vec::new()).method(), Method::DELETE);
    }

    #[test]
    fn test_put_form_is_unsupported() {
        let err = HttpRequest::for_method(TaskMethod::HttpPutForm, &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("unsupported http protocol HTTP_PUT_FORM"));
        assert!(HttpRequest::for_method(TaskMethod::Shell, &HashMap::new()).is_err());
    }

    #[test]
    fn test_response_success_range() {
        let ok = HttpResponse {
            status: 204,
            body: Vec::new(),
        };
        assert!(ok.is_success());
        let missing = HttpResponse {
            status: 404,
            body: Vec::new(),
        };
        assert!(!missing.is_success());
    }
}

use std::time;

use async_trait::async_trait;
use http::StatusCode;
use passport_common::passport::Passport;
use reqwest::header;

use crate::error::LookupError;

/// Resolves a business key to the current passport projection.
#[async_trait]
pub trait EntityLookup: Send + Sync {
    async fn get_entity_by_key(&self, business_key: &str) -> Result<Passport, LookupError>;
}

/// HTTP client for the registry's passport projection endpoint.
#[derive(Clone)]
pub struct RegistryClient {
    client: reqwest::Client,
    base_url: reqwest::Url,
}

impl RegistryClient {
    pub fn new(base_url: &str, request_timeout: time::Duration) -> Result<Self, LookupError> {
        let base_url =
            reqwest::Url::parse(base_url).map_err(|e| LookupError::Url(e.to_string()))?;
        if base_url.cannot_be_a_base() {
            return Err(LookupError::Url(base_url.to_string()));
        }

        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::ACCEPT,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("passport-indexer")
            .timeout(request_timeout)
            .build()
            .map_err(LookupError::Request)?;

        Ok(Self { client, base_url })
    }

    fn passport_url(&self, business_key: &str) -> Result<reqwest::Url, LookupError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| LookupError::Url(self.base_url.to_string()))?
            .pop_if_empty()
            .extend(["passports", business_key]);
        Ok(url)
    }
}

#[async_trait]
impl EntityLookup for RegistryClient {
    async fn get_entity_by_key(&self, business_key: &str) -> Result<Passport, LookupError> {
        let url = self.passport_url(business_key)?;

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(LookupError::Request)?;

        match response.status() {
            status if status.is_success() => {
                response.json::<Passport>().await.map_err(LookupError::Decode)
            }
            status if status == StatusCode::NOT_FOUND => {
                Err(LookupError::NotFound(business_key.to_owned()))
            }
            status => Err(LookupError::Status {
                key: business_key.to_owned(),
                status,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;

    #[test]
    fn test_passport_url() {
        let client =
            RegistryClient::new("http://registry:8080/api", time::Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.passport_url("123").unwrap().as_str(),
            "http://registry:8080/api/passports/123"
        );

        let client =
            RegistryClient::new("http://registry:8080/", time::Duration::from_secs(1)).unwrap();
        assert_eq!(
            client.passport_url("123").unwrap().as_str(),
            "http://registry:8080/passports/123"
        );
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(matches!(
            RegistryClient::new("not a url", time::Duration::from_secs(1)),
            Err(LookupError::Url(_))
        ));
    }

    #[tokio::test]
    async fn test_get_entity_by_key() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/passports/123456789012345");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(serde_json::json!({
                    "imeiNumber": "123456789012345",
                    "phoneName": "Galaxy S20",
                    "manufacturer": "Samsung",
                }));
        });

        let client = RegistryClient::new(&server.base_url(), time::Duration::from_secs(5)).unwrap();
        let passport = client
            .get_entity_by_key("123456789012345")
            .await
            .expect("lookup failed");

        mock.assert();
        assert_eq!(passport.phone_name, "Galaxy S20");
        assert_eq!(passport.manufacturer, "Samsung");
    }

    #[tokio::test]
    async fn test_unknown_key_is_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/passports/404");
            then.status(404);
        });
        server.mock(|when, then| {
            when.method(GET).path("/passports/500");
            then.status(500);
        });
        server.mock(|when, then| {
            when.method(GET).path("/passports/garbage");
            then.status(200).body("<html>");
        });

        let client = RegistryClient::new(&server.base_url(), time::Duration::from_secs(5)).unwrap();

        assert!(matches!(
            client.get_entity_by_key("404").await,
            Err(LookupError::NotFound(key)) if key == "404"
        ));
        assert!(matches!(
            client.get_entity_by_key("500").await,
            Err(LookupError::Status { status, .. }) if status == StatusCode::INTERNAL_SERVER_ERROR
        ));
        assert!(matches!(
            client.get_entity_by_key("garbage").await,
            Err(LookupError::Decode(_))
        ));
    }
}

//! 天气工具：OpenWeatherMap 当前天气
//!
//! 需要 [tools].weather_api_key（或环境变量 OPENWEATHER_API_KEY）。温度由开尔文换算为摄氏度。

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;

use crate::tools::registry::{ParamSpec, Tool};

const DEFAULT_ENDPOINT: &str = "https://api.openweathermap.org/data/2.5/weather";

#[derive(Debug, Deserialize)]
struct WeatherResponse {
    main: MainBlock,
    #[serde(default)]
    weather: Vec<Condition>,
}

#[derive(Debug, Deserialize)]
struct MainBlock {
    temp: f64,
}

#[derive(Debug, Deserialize)]
struct Condition {
    description: String,
}

pub struct WeatherTool {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl WeatherTool {
    pub fn new(api_key: impl Into<String>, timeout_secs: u64) -> Self {
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs.max(1)))
            .build()
            .unwrap_or_default();
        Self {
            client,
            endpoint: DEFAULT_ENDPOINT.to_string(),
            api_key: api_key.into(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = endpoint.into();
        self
    }
}

/// 把 API 响应格式化为一句话
fn describe(city: &str, body: &WeatherResponse) -> String {
    let celsius = ((body.main.temp - 273.15) * 10.0).round() / 10.0;
    let condition = body
        .weather
        .first()
        .map(|c| c.description.as_str())
        .unwrap_or("unknown conditions");
    format!(
        "The weather in {} is {} with a temperature of {}°C.",
        city, condition, celsius
    )
}

#[async_trait]
impl Tool for WeatherTool {
    fn name(&self) -> &str {
        "get_forecast"
    }

    fn description(&self) -> &str {
        "Get the current weather for a city."
    }

    fn parameters(&self) -> Vec<ParamSpec> {
        vec![ParamSpec::required(
            "city",
            "string",
            "Name of the city whose weather is fetched",
        )]
    }

    fn return_description(&self) -> &str {
        "Weather description and temperature in Celsius"
    }

    async fn execute(&self, args: Value) -> Result<String, String> {
        let city = args
            .get("city")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .trim();
        if self.api_key.is_empty() {
            return Err("weather api key not configured".to_string());
        }
        tracing::info!(city = %city, "weather lookup");
        let resp = self
            .client
            .get(&self.endpoint)
            .query(&[("q", city), ("APPID", self.api_key.as_str())])
            .send()
            .await
            .map_err(|e| format!("Request failed: {}", e))?;
        if !resp.status().is_success() {
            return Err(format!("HTTP {}", resp.status()));
        }
        let body: WeatherResponse = resp
            .json()
            .await
            .map_err(|e| format!("Invalid weather response: {}", e))?;
        Ok(describe(city, &body))
    }
}

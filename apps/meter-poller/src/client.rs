use async_trait::async_trait;
use chrono::{DateTime, Local, SecondsFormat, TimeZone, Utc};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use std::time::Duration;
use url::Url;

use crate::error::FetchError;
use crate::model::{ContractDetails, CurrentReading, PeriodReading};
use crate::time::parse_timestamp;

pub type FetchResult<T> = Result<T, FetchError>;

/// Metering API as seen by the pollers. Transport, auth and timeouts live behind it.
#[async_trait]
pub trait MeterClient: Send + Sync {
    async fn fetch_contract_details(&self) -> FetchResult<ContractDetails>;

    async fn fetch_current_reading(&self) -> FetchResult<CurrentReading>;

    /// Per-period readings for `[start, end)`.
    async fn fetch_period_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FetchResult<Vec<PeriodReading>>;
}

#[derive(Debug, Deserialize)]
struct ContractEnvelope {
    #[serde(rename = "listContador", default)]
    meters: Vec<MeterEntry>,
}

#[derive(Debug, Deserialize)]
struct MeterEntry {
    #[serde(rename = "numSerieEquipo")]
    serial: JsonValue,
    #[serde(rename = "tipMarca", default)]
    manufacturer: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MeasureEnvelope {
    accumulate: f64,
    #[serde(default)]
    observed_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ConsumptionEnvelope {
    #[serde(default)]
    historical: Vec<(String, f64)>,
}

#[derive(Debug, Clone)]
pub struct HttpMeterClient {
    http: Client,
    base: Url,
    token: Option<String>,
}

impl HttpMeterClient {
    pub fn new(base: Url, token: Option<String>, timeout: Duration) -> FetchResult<Self> {
        let http = Client::builder().timeout(timeout).build()?;
        let mut base = base;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self { http, base, token })
    }

    async fn get_json<T: DeserializeOwned>(&self, url: Url) -> FetchResult<T> {
        let mut request = self.http.get(url);
        if let Some(token) = self.token.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response.json::<T>().await?)
    }
}

#[async_trait]
impl MeterClient for HttpMeterClient {
    async fn fetch_contract_details(&self) -> FetchResult<ContractDetails> {
        let url = self.base.join("contract")?;
        let envelope: ContractEnvelope = self.get_json(url).await?;
        contract_details_from(envelope)
    }

    async fn fetch_current_reading(&self) -> FetchResult<CurrentReading> {
        let url = self.base.join("measure")?;
        let envelope: MeasureEnvelope = self.get_json(url).await?;
        current_reading_from(envelope, &Local, Utc::now())
    }

    async fn fetch_period_readings(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> FetchResult<Vec<PeriodReading>> {
        let mut url = self.base.join("consumption")?;
        url.query_pairs_mut()
            .append_pair("start", &start.to_rfc3339_opts(SecondsFormat::Secs, true))
            .append_pair("end", &end.to_rfc3339_opts(SecondsFormat::Secs, true));
        let envelope: ConsumptionEnvelope = self.get_json(url).await?;
        period_readings_from(envelope, &Local)
    }
}

fn contract_details_from(envelope: ContractEnvelope) -> FetchResult<ContractDetails> {
    let meter = envelope
        .meters
        .into_iter()
        .next()
        .ok_or_else(|| FetchError::InvalidResponse("contract lists no meters".to_string()))?;
    let serial = match meter.serial {
        JsonValue::String(value) => value.trim().to_string(),
        JsonValue::Number(value) => value.to_string(),
        other => {
            return Err(FetchError::InvalidResponse(format!(
                "unexpected meter serial {other}"
            )))
        }
    };
    Ok(ContractDetails {
        serial,
        manufacturer: meter.manufacturer.unwrap_or_default().trim().to_string(),
    })
}

fn current_reading_from<Tz: TimeZone>(
    envelope: MeasureEnvelope,
    tz: &Tz,
    received_at: DateTime<Utc>,
) -> FetchResult<CurrentReading> {
    if !envelope.accumulate.is_finite() {
        return Err(FetchError::InvalidResponse(format!(
            "non-finite accumulated reading {}",
            envelope.accumulate
        )));
    }
    let observed_at = match envelope.observed_at.as_deref() {
        Some(raw) => parse_timestamp(tz, raw)
            .ok_or_else(|| FetchError::InvalidResponse(format!("bad timestamp {raw:?}")))?,
        None => received_at,
    };
    Ok(CurrentReading {
        value: envelope.accumulate,
        observed_at,
    })
}

fn period_readings_from<Tz: TimeZone>(
    envelope: ConsumptionEnvelope,
    tz: &Tz,
) -> FetchResult<Vec<PeriodReading>> {
    envelope
        .historical
        .into_iter()
        .map(|(raw, value)| -> FetchResult<PeriodReading> {
            let timestamp = parse_timestamp(tz, &raw)
                .ok_or_else(|| FetchError::InvalidResponse(format!("bad timestamp {raw:?}")))?;
            Ok(PeriodReading { timestamp, value })
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn contract_details_accept_numeric_serial() {
        let envelope: ContractEnvelope = serde_json::from_value(json!({
            "listContador": [{"numSerieEquipo": 21093457, "tipMarca": "ZIV "}]
        }))
        .unwrap();
        let details = contract_details_from(envelope).unwrap();
        assert_eq!(details.serial, "21093457");
        assert_eq!(details.manufacturer, "ZIV");
    }

    #[test]
    fn contract_without_meters_is_invalid() {
        let envelope: ContractEnvelope = serde_json::from_value(json!({})).unwrap();
        assert!(matches!(
            contract_details_from(envelope),
            Err(FetchError::InvalidResponse(_))
        ));
    }

    #[test]
    fn measure_without_timestamp_uses_receive_time() {
        let received_at = Utc.with_ymd_and_hms(2024, 2, 1, 10, 0, 0).unwrap();
        let envelope: MeasureEnvelope =
            serde_json::from_value(json!({"accumulate": 5123.0})).unwrap();
        let reading = current_reading_from(envelope, &Utc, received_at).unwrap();
        assert_eq!(reading.value, 5123.0);
        assert_eq!(reading.observed_at, received_at);
    }

    #[test]
    fn consumption_rows_are_parsed_in_local_zone() {
        let tz = chrono_tz::Europe::Madrid;
        let envelope: ConsumptionEnvelope = serde_json::from_value(json!({
            "historical": [["2024-01-01 00:00:00", 0.25], ["2024-01-01T01:00:00+01:00", 0.5]]
        }))
        .unwrap();
        let readings = period_readings_from(envelope, &tz).unwrap();
        assert_eq!(readings.len(), 2);
        assert_eq!(
            readings[0].timestamp,
            Utc.with_ymd_and_hms(2023, 12, 31, 23, 0, 0).unwrap()
        );
        assert_eq!(readings[1].value, 0.5);
    }

    #[test]
    fn consumption_with_bad_timestamp_fails_whole_batch() {
        let envelope: ConsumptionEnvelope = serde_json::from_value(json!({
            "historical": [["2024-01-01 00:00:00", 0.25], ["garbage", 0.5]]
        }))
        .unwrap();
        assert!(period_readings_from(envelope, &Utc).is_err());
    }

    #[test]
    fn base_url_gets_trailing_slash() {
        let client = HttpMeterClient::new(
            Url::parse("http://127.0.0.1:8080/api/v1").unwrap(),
            None,
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(
            client.base.join("measure").unwrap().as_str(),
            "http://127.0.0.1:8080/api/v1/measure"
        );
    }
}

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use shared_logging::LogLevel;

use crate::{
    config::PipelineConfig,
    estimator::ModelBundle,
    storage::{ObjectStore, StorageError},
    table::Table,
    telemetry::PipelineTelemetry,
};

const TEXT_FIELDS: [&str; 3] = ["Gender", "Vehicle_Age", "Vehicle_Damage"];

/// Vehicle attributes, either as raw categories or as the encoded indicator
/// columns a web form submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VehicleCategories {
    /// Raw category labels, e.g. `"< 1 Year"` and `"Yes"`.
    Raw {
        /// Age bracket of the vehicle.
        #[serde(rename = "Vehicle_Age")]
        vehicle_age: String,
        /// Whether the vehicle was damaged before.
        #[serde(rename = "Vehicle_Damage")]
        vehicle_damage: String,
    },
    /// Pre-encoded indicator columns.
    Encoded {
        /// `1` when the vehicle is less than a year old.
        #[serde(rename = "Vehicle_Age_lt_1_Year")]
        lt_1_year: u8,
        /// `1` when the vehicle is more than two years old.
        #[serde(rename = "Vehicle_Age_gt_2_Years")]
        gt_2_years: u8,
        /// `1` when the vehicle was damaged before.
        #[serde(rename = "Vehicle_Damage_Yes")]
        damage_yes: u8,
    },
}

/// One customer record submitted for prediction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VehicleData {
    /// `Male`/`Female`, or the mapped code.
    #[serde(rename = "Gender")]
    pub gender: String,
    /// Customer age in years.
    #[serde(rename = "Age")]
    pub age: i64,
    /// `1` when the customer holds a licence.
    #[serde(rename = "Driving_License")]
    pub driving_license: i64,
    /// Region identifier.
    #[serde(rename = "Region_Code")]
    pub region_code: f64,
    /// `1` when the customer already has vehicle insurance.
    #[serde(rename = "Previously_Insured")]
    pub previously_insured: i64,
    /// Yearly health premium.
    #[serde(rename = "Annual_Premium")]
    pub annual_premium: f64,
    /// Outreach channel identifier.
    #[serde(rename = "Policy_Sales_Channel")]
    pub policy_sales_channel: f64,
    /// Days the customer has been associated with the company.
    #[serde(rename = "Vintage")]
    pub vintage: i64,
    /// Vehicle categories.
    #[serde(flatten)]
    pub vehicle: VehicleCategories,
}

impl VehicleData {
    /// Builds a record from `NAME=VALUE` style pairs. Text fields are kept as
    /// given, every other field must parse as a number.
    pub fn from_fields<I, K, V>(fields: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let mut map = Map::new();
        for (name, raw) in fields {
            let name = name.into();
            let raw = raw.into();
            let value = if TEXT_FIELDS.contains(&name.as_str()) {
                Value::String(raw)
            } else {
                parse_number(&raw).with_context(|| format!("field {name} is not a number: {raw}"))?
            };
            if map.insert(name.clone(), value).is_some() {
                bail!("field {name} given more than once");
            }
        }
        serde_json::from_value(Value::Object(map)).context("incomplete vehicle record")
    }

    /// One-row table in the raw collection layout.
    pub fn to_table(&self) -> Result<Table> {
        let mut columns = vec![
            "Gender",
            "Age",
            "Driving_License",
            "Region_Code",
            "Previously_Insured",
            "Annual_Premium",
            "Policy_Sales_Channel",
            "Vintage",
        ];
        let mut row = vec![
            self.gender.clone(),
            self.age.to_string(),
            self.driving_license.to_string(),
            self.region_code.to_string(),
            self.previously_insured.to_string(),
            self.annual_premium.to_string(),
            self.policy_sales_channel.to_string(),
            self.vintage.to_string(),
        ];
        match &self.vehicle {
            VehicleCategories::Raw {
                vehicle_age,
                vehicle_damage,
            } => {
                columns.extend(["Vehicle_Age", "Vehicle_Damage"]);
                row.extend([vehicle_age.clone(), vehicle_damage.clone()]);
            }
            VehicleCategories::Encoded {
                lt_1_year,
                gt_2_years,
                damage_yes,
            } => {
                columns.extend([
                    "Vehicle_Age_lt_1_Year",
                    "Vehicle_Age_gt_2_Years",
                    "Vehicle_Damage_Yes",
                ]);
                row.extend([
                    lt_1_year.to_string(),
                    gt_2_years.to_string(),
                    damage_yes.to_string(),
                ]);
            }
        }
        Table::from_rows(
            columns.into_iter().map(str::to_owned).collect(),
            vec![row.into_iter().map(Some).collect()],
        )
    }
}

fn parse_number(raw: &str) -> Result<Value> {
    let raw = raw.trim();
    if let Ok(int) = raw.parse::<i64>() {
        return Ok(Value::from(int));
    }
    let float = raw.parse::<f64>()?;
    serde_json::Number::from_f64(float)
        .map(Value::Number)
        .context("non-finite number")
}

/// Result of one prediction request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionResponse {
    /// `success` or `error`.
    pub status: String,
    /// Predicted class when the request succeeded.
    pub prediction: Option<u8>,
    /// Failure description when it did not.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PredictionResponse {
    /// Successful response.
    #[must_use]
    pub fn success(prediction: u8) -> Self {
        Self {
            status: "success".into(),
            prediction: Some(prediction),
            error: None,
        }
    }

    /// Failed response.
    #[must_use]
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            status: "error".into(),
            prediction: None,
            error: Some(message.into()),
        }
    }

    /// Human-readable label, as shown on the form page.
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self.prediction {
            Some(1) => "Response-Yes",
            Some(_) => "Response-No",
            None => "Error",
        }
    }
}

/// Serves predictions from the deployed bundle.
///
/// The bundle is fetched on first use and cached for the lifetime of the
/// pipeline, until [`PredictionPipeline::invalidate`] is called.
pub struct PredictionPipeline {
    bucket_name: String,
    model_key: String,
    objects: Arc<dyn ObjectStore>,
    telemetry: PipelineTelemetry,
    cached: RwLock<Option<Arc<ModelBundle>>>,
}

impl std::fmt::Debug for PredictionPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PredictionPipeline")
            .field("bucket_name", &self.bucket_name)
            .field("model_key", &self.model_key)
            .field("cached", &self.cached.read().is_some())
            .finish_non_exhaustive()
    }
}

impl PredictionPipeline {
    /// Creates a pipeline reading `bucket_name/model_key` from `objects`.
    #[must_use]
    pub fn new(
        bucket_name: impl Into<String>,
        model_key: impl Into<String>,
        objects: Arc<dyn ObjectStore>,
        telemetry: PipelineTelemetry,
    ) -> Self {
        Self {
            bucket_name: bucket_name.into(),
            model_key: model_key.into(),
            objects,
            telemetry: telemetry.for_module("prediction_pipeline"),
            cached: RwLock::new(None),
        }
    }

    /// Creates a pipeline for the model location named in `config`.
    #[must_use]
    pub fn from_config(
        config: &PipelineConfig,
        objects: Arc<dyn ObjectStore>,
        telemetry: PipelineTelemetry,
    ) -> Self {
        Self::new(
            config.storage.bucket_name.clone(),
            config.storage.model_key.clone(),
            objects,
            telemetry,
        )
    }

    /// Telemetry the pipeline logs through.
    #[must_use]
    pub const fn telemetry(&self) -> &PipelineTelemetry {
        &self.telemetry
    }

    /// Predicts the class of one record.
    pub fn predict(&self, data: &VehicleData) -> Result<u8> {
        self.predict_with(data, &self.telemetry)
    }

    /// Predicts the class of one record, logging through `telemetry`.
    pub fn predict_with(&self, data: &VehicleData, telemetry: &PipelineTelemetry) -> Result<u8> {
        let bundle = self.bundle(telemetry)?;
        let table = data.to_table()?;
        let prediction = bundle
            .predict(&table)
            .context("model bundle rejected the record")?
            .first()
            .copied()
            .context("model returned no prediction")?;
        let _ = telemetry.log(
            LogLevel::Info,
            &format!("Prediction: {prediction}"),
            json!({ "prediction": prediction }),
        );
        Ok(prediction)
    }

    /// Drops the cached bundle so the next prediction fetches it again.
    pub fn invalidate(&self) {
        *self.cached.write() = None;
    }

    fn bundle(&self, telemetry: &PipelineTelemetry) -> Result<Arc<ModelBundle>> {
        if let Some(bundle) = self.cached.read().as_ref() {
            return Ok(Arc::clone(bundle));
        }
        let mut slot = self.cached.write();
        if let Some(bundle) = slot.as_ref() {
            return Ok(Arc::clone(bundle));
        }
        if !self.objects.exists(&self.bucket_name, &self.model_key)? {
            return Err(StorageError::NotFound {
                bucket: self.bucket_name.clone(),
                key: self.model_key.clone(),
            }
            .into());
        }
        let bytes = self.objects.get(&self.bucket_name, &self.model_key)?;
        let bundle = Arc::new(ModelBundle::from_bytes(&bytes).with_context(|| {
            format!("decoding model {}/{}", self.bucket_name, self.model_key)
        })?);
        let _ = telemetry.log(
            LogLevel::Info,
            "Loaded model bundle from object store",
            json!({
                "bucket": self.bucket_name,
                "key": self.model_key,
                "features": bundle.n_features(),
            }),
        );
        *slot = Some(Arc::clone(&bundle));
        Ok(bundle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        progress::{self, ProgressMessage},
        storage::MemoryObjectStore,
        test_support,
    };
    use std::time::Duration;
    use tempfile::tempdir;
    use tokio::runtime::Runtime;

    const BUCKET: &str = "models";
    const KEY: &str = "registry/model.json";

    fn deployed_store(dir: &std::path::Path) -> Arc<MemoryObjectStore> {
        let run = test_support::trained_run(dir);
        let bytes = std::fs::read(&run.trainer.trained_model_file_path).unwrap();
        let store = Arc::new(MemoryObjectStore::new());
        store.put(BUCKET, KEY, &bytes).unwrap();
        store
    }

    fn likely_buyer() -> VehicleData {
        VehicleData {
            gender: "Male".into(),
            age: 44,
            driving_license: 1,
            region_code: 28.0,
            previously_insured: 0,
            annual_premium: 35_000.0,
            policy_sales_channel: 26.0,
            vintage: 230,
            vehicle: VehicleCategories::Raw {
                vehicle_age: "> 2 Years".into(),
                vehicle_damage: "Yes".into(),
            },
        }
    }

    fn unlikely_buyer() -> VehicleData {
        VehicleData {
            gender: "Female".into(),
            age: 24,
            driving_license: 1,
            region_code: 8.0,
            previously_insured: 1,
            annual_premium: 5_000.0,
            policy_sales_channel: 152.0,
            vintage: 40,
            vehicle: VehicleCategories::Raw {
                vehicle_age: "< 1 Year".into(),
                vehicle_damage: "No".into(),
            },
        }
    }

    #[test]
    fn predicts_both_classes_from_raw_records() {
        let dir = tempdir().unwrap();
        let pipeline = PredictionPipeline::new(
            BUCKET,
            KEY,
            deployed_store(dir.path()),
            PipelineTelemetry::disabled(),
        );
        assert_eq!(pipeline.predict(&likely_buyer()).unwrap(), 1);
        assert_eq!(pipeline.predict(&unlikely_buyer()).unwrap(), 0);
    }

    #[test]
    fn encoded_form_fields_match_raw_categories() {
        let dir = tempdir().unwrap();
        let pipeline = PredictionPipeline::new(
            BUCKET,
            KEY,
            deployed_store(dir.path()),
            PipelineTelemetry::disabled(),
        );
        let form = VehicleData::from_fields([
            ("Gender", "1"),
            ("Age", "44"),
            ("Driving_License", "1"),
            ("Region_Code", "28"),
            ("Previously_Insured", "0"),
            ("Annual_Premium", "35000.0"),
            ("Policy_Sales_Channel", "26"),
            ("Vintage", "230"),
            ("Vehicle_Age_lt_1_Year", "0"),
            ("Vehicle_Age_gt_2_Years", "1"),
            ("Vehicle_Damage_Yes", "1"),
        ])
        .unwrap();
        assert!(matches!(form.vehicle, VehicleCategories::Encoded { .. }));
        assert_eq!(
            pipeline.predict(&form).unwrap(),
            pipeline.predict(&likely_buyer()).unwrap()
        );
    }

    #[test]
    fn from_fields_reports_bad_input() {
        let err = VehicleData::from_fields([("Age", "forty")]).unwrap_err();
        assert!(err.to_string().contains("Age"));
        let err = VehicleData::from_fields([("Age", "40"), ("Age", "41")]).unwrap_err();
        assert!(err.to_string().contains("more than once"));
        assert!(VehicleData::from_fields([("Age", "40")]).is_err());
    }

    #[test]
    fn missing_model_is_a_storage_error() {
        let pipeline = PredictionPipeline::new(
            BUCKET,
            KEY,
            Arc::new(MemoryObjectStore::new()),
            PipelineTelemetry::disabled(),
        );
        let err = pipeline.predict(&likely_buyer()).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::NotFound { .. })
        ));
    }

    #[test]
    fn bundle_is_cached_until_invalidated() {
        let dir = tempdir().unwrap();
        let store = deployed_store(dir.path());
        let pipeline = PredictionPipeline::new(
            BUCKET,
            KEY,
            store.clone(),
            PipelineTelemetry::disabled(),
        );
        pipeline.predict(&likely_buyer()).unwrap();
        store.put(BUCKET, KEY, b"not a bundle").unwrap();
        assert!(pipeline.predict(&likely_buyer()).is_ok());
        pipeline.invalidate();
        assert!(pipeline.predict(&likely_buyer()).is_err());
    }

    #[test]
    fn response_serialization_omits_absent_error() {
        let value = serde_json::to_value(PredictionResponse::success(1)).unwrap();
        assert_eq!(value, json!({ "status": "success", "prediction": 1 }));
        assert_eq!(PredictionResponse::success(0).label(), "Response-No");
        assert_eq!(PredictionResponse::failure("boom").label(), "Error");
    }

    #[test]
    fn prediction_stream_carries_result_before_done() {
        let dir = tempdir().unwrap();
        let pipeline = Arc::new(PredictionPipeline::new(
            BUCKET,
            KEY,
            deployed_store(dir.path()),
            PipelineTelemetry::disabled(),
        ));
        let rt = Runtime::new().unwrap();
        rt.block_on(async {
            let mut stream =
                progress::spawn_prediction(pipeline, likely_buyer(), Duration::from_secs(5));
            let mut messages = Vec::new();
            while let Some(message) = stream.next().await {
                messages.push(message);
            }
            assert!(matches!(messages.first(), Some(ProgressMessage::Line(_))));
            match &messages[messages.len() - 2] {
                ProgressMessage::Result(payload) => {
                    assert_eq!(payload["status"], "success");
                    assert_eq!(payload["prediction"], 1);
                }
                other => panic!("unexpected message {other:?}"),
            }
            assert_eq!(messages.last(), Some(&ProgressMessage::Finished));
            let response = stream.finish().await.unwrap().unwrap();
            assert_eq!(response.prediction, Some(1));
        });
    }
}

//! Fitness-data provider: daily steps, calories and workouts.

use async_trait::async_trait;
use chrono::NaiveDate;
use color_eyre::Result;
use serde::{Deserialize, Serialize};

use super::error::ProviderError;
use super::http::{HttpProvider, HttpSettings};
use super::{FetchParams, ProviderClient};
use crate::cache::Payload;

/// Activity totals for one day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitnessDay {
  pub date: NaiveDate,
  pub steps: u32,
  pub calories_burned: f64,
  pub workout_count: u32,
  pub workout_duration_minutes: u32,
}

impl Payload for FitnessDay {
  fn payload_type() -> &'static str {
    "fitness_day"
  }

  fn validate(&self) -> Result<(), String> {
    if !self.calories_burned.is_finite() || self.calories_burned < 0.0 {
      return Err(format!("calories_burned out of range: {}", self.calories_burned));
    }
    if self.workout_count == 0 && self.workout_duration_minutes > 0 {
      return Err("workout minutes reported without workouts".to_string());
    }
    Ok(())
  }
}

/// Raw activity response from the fitness API.
#[derive(Debug, Deserialize)]
struct ApiActivityResponse {
  date: NaiveDate,
  steps: u32,
  calories_burned: f64,
  #[serde(default)]
  workouts: Vec<ApiWorkout>,
}

#[derive(Debug, Deserialize)]
struct ApiWorkout {
  duration_minutes: u32,
}

impl ApiActivityResponse {
  fn into_day(self) -> FitnessDay {
    FitnessDay {
      date: self.date,
      steps: self.steps,
      calories_burned: self.calories_burned,
      workout_count: u32::try_from(self.workouts.len()).unwrap_or(u32::MAX),
      workout_duration_minutes: self
        .workouts
        .iter()
        .fold(0u32, |total, w| total.saturating_add(w.duration_minutes)),
    }
  }
}

/// Fitness API client.
#[derive(Clone)]
pub struct FitnessClient {
  http: HttpProvider,
}

impl FitnessClient {
  pub const NAME: &'static str = "fitness";

  pub fn new(settings: &HttpSettings) -> Result<Self> {
    Ok(Self {
      http: HttpProvider::new(settings)?,
    })
  }
}

#[async_trait]
impl ProviderClient for FitnessClient {
  type Payload = FitnessDay;

  fn name(&self) -> &'static str {
    Self::NAME
  }

  async fn fetch(&self, params: &FetchParams) -> Result<FitnessDay, ProviderError> {
    // The bucket is the day; without one we ask for the day `until` falls on.
    let date = params
      .bucket
      .clone()
      .unwrap_or_else(|| params.until.date_naive().to_string());

    let mut url = self.http.endpoint(&["v1", "users", &params.user_id, "activity"]);
    {
      let mut query = url.query_pairs_mut();
      query.append_pair("date", &date);
      if let Some(since) = params.since {
        query.append_pair("since", &since.to_rfc3339());
      }
      query.append_pair("until", &params.until.to_rfc3339());
    }

    let response: ApiActivityResponse = self.http.get_json(url).await?;
    Ok(response.into_day())
  }
}

//! AI-assisted member suggestions.
//!
//! The remote service is asked for `count` member ids picked from a candidate
//! roster. Its reply must be a JSON document `{"memberIds": [...],
//! "rationale": "..."}`; anything else counts as a failed attempt. A failed
//! attempt is retried exactly once before the failure is reported.

use crate::common::course::CourseCode;
use crate::common::models::{User, UserId};
use crate::server::error::{ServiceError, ServiceResult};
use async_trait::async_trait;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::time::Duration;

const MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Suggestion {
    #[serde(rename = "memberIds", alias = "member_ids")]
    pub member_ids: Vec<UserId>,
    #[serde(default)]
    pub rationale: String,
}

#[async_trait]
pub trait MemberSuggester: Send + Sync {
    async fn suggest_members(
        &self,
        course: &CourseCode,
        requester: &User,
        candidates: &[User],
        count: usize,
    ) -> ServiceResult<Suggestion>;
}

pub fn parse_suggestion(body: &str) -> ServiceResult<Suggestion> {
    serde_json::from_str(body.trim())
        .map_err(|e| ServiceError::ExternalService(format!("Unreadable suggestion: {}", e)))
}

#[derive(Serialize)]
struct ProfileSummary<'a> {
    id: &'a str,
    name: &'a str,
    year: Option<&'a str>,
    availability: Option<&'a str>,
    courses: &'a [CourseCode],
}

impl<'a> From<&'a User> for ProfileSummary<'a> {
    fn from(user: &'a User) -> Self {
        ProfileSummary {
            id: &user.id,
            name: &user.name,
            year: user.year.as_deref(),
            availability: user.availability.as_deref(),
            courses: &user.courses_seeking,
        }
    }
}

#[derive(Serialize)]
struct SuggestionQuery<'a> {
    course: &'a CourseCode,
    count: usize,
    requester: ProfileSummary<'a>,
    candidates: Vec<ProfileSummary<'a>>,
}

pub struct HttpSuggester {
    client: reqwest::Client,
    url: String,
    api_key: Option<String>,
}

impl HttpSuggester {
    pub fn new(url: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.to_string(),
            api_key,
        })
    }

    async fn attempt(&self, query: &SuggestionQuery<'_>) -> ServiceResult<Suggestion> {
        let mut request = self.client.post(&self.url).json(query);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("Suggestion service unreachable: {}", e)))?;
        let status = response.status();
        if !status.is_success() {
            return Err(ServiceError::ExternalService(format!(
                "Suggestion service answered {}",
                status
            )));
        }
        let body = response
            .text()
            .await
            .map_err(|e| ServiceError::ExternalService(format!("Suggestion body unreadable: {}", e)))?;
        parse_suggestion(&body)
    }
}

#[async_trait]
impl MemberSuggester for HttpSuggester {
    async fn suggest_members(
        &self,
        course: &CourseCode,
        requester: &User,
        candidates: &[User],
        count: usize,
    ) -> ServiceResult<Suggestion> {
        let query = SuggestionQuery {
            course,
            count,
            requester: requester.into(),
            candidates: candidates.iter().map(ProfileSummary::from).collect(),
        };

        let mut last_error = None;
        for attempt in 1..=MAX_ATTEMPTS {
            match self.attempt(&query).await {
                Ok(suggestion) => {
                    info!(
                        "[AI] Received {} suggested members for {} (attempt {})",
                        suggestion.member_ids.len(),
                        course,
                        attempt
                    );
                    return Ok(suggestion);
                }
                Err(e) => {
                    warn!("[AI] Suggestion attempt {} for {} failed: {}", attempt, course, e);
                    last_error = Some(e);
                }
            }
        }
        Err(last_error.unwrap_or_else(|| ServiceError::ExternalService("No suggestion attempt made".to_string())))
    }
}

/// Stand-in when no suggestion service is configured.
#[derive(Debug, Default, Clone)]
pub struct DisabledSuggester;

#[async_trait]
impl MemberSuggester for DisabledSuggester {
    async fn suggest_members(
        &self,
        _course: &CourseCode,
        _requester: &User,
        _candidates: &[User],
        _count: usize,
    ) -> ServiceResult<Suggestion> {
        Err(ServiceError::ExternalService(
            "AI member suggestions are not configured".to_string(),
        ))
    }
}

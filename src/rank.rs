//! Client for the two ranking services (ScoreSaber and BeatLeader).
//!
//! Each service has its own player shape; both are normalised into
//! [`PlayerInfo`] before leaving this module. The ScoreSaber ranked
//! leaderboard listing used by the playlist synchroniser lives here too.

use std::fmt;
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::debug;

// ---------------------------------------------------------------------------
// Platform
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    ScoreSaber,
    BeatLeader,
}

impl Platform {
    /// Human-facing service name.
    pub fn label(self) -> &'static str {
        match self {
            Platform::ScoreSaber => "ScoreSaber",
            Platform::BeatLeader => "BeatLeader",
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Platform::ScoreSaber => "scoresaber",
            Platform::BeatLeader => "beatleader",
        })
    }
}

impl FromStr for Platform {
    type Err = RankError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "scoresaber" => Ok(Platform::ScoreSaber),
            "beatleader" => Ok(Platform::BeatLeader),
            _ => Err(RankError::UnsupportedPlatform(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RankError {
    /// The caller asked for a service we don't know. Usage error, no request
    /// was made.
    #[error("Unsupported platform `{0}`. Use `scoresaber` or `beatleader`.")]
    UnsupportedPlatform(String),
    /// The remote call failed or returned something we couldn't use.
    #[error("{service} lookup failed: {reason}")]
    RemoteLookupFailed {
        service: &'static str,
        reason: String,
    },
}

impl RankError {
    fn remote(service: &'static str, reason: impl fmt::Display) -> Self {
        RankError::RemoteLookupFailed {
            service,
            reason: reason.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Normalised player record
// ---------------------------------------------------------------------------

/// A player profile, normalised across services.
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub name: String,
    pub global_rank: u64,
    pub country: String,
    pub performance_points: f64,
    pub avatar_url: String,
}

/// `GET /player/{id}/basic` on ScoreSaber.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScoreSaberPlayer {
    name: String,
    rank: u64,
    country: String,
    pp: f64,
    profile_picture: String,
}

impl From<ScoreSaberPlayer> for PlayerInfo {
    fn from(p: ScoreSaberPlayer) -> Self {
        PlayerInfo {
            name: p.name,
            global_rank: p.rank,
            country: p.country,
            performance_points: p.pp,
            avatar_url: p.profile_picture,
        }
    }
}

/// `GET /player/{id}` on BeatLeader.
#[derive(Debug, Deserialize)]
struct BeatLeaderPlayer {
    name: String,
    #[serde(rename = "globalRank", alias = "rank")]
    global_rank: u64,
    country: String,
    pp: f64,
    avatar: String,
}

impl From<BeatLeaderPlayer> for PlayerInfo {
    fn from(p: BeatLeaderPlayer) -> Self {
        PlayerInfo {
            name: p.name,
            global_rank: p.global_rank,
            country: p.country,
            performance_points: p.pp,
            avatar_url: p.avatar,
        }
    }
}

impl PlayerInfo {
    fn validate(self, service: &'static str) -> Result<Self, RankError> {
        if !self.performance_points.is_finite() || self.performance_points < 0.0 {
            return Err(RankError::remote(
                service,
                format!("invalid pp value {}", self.performance_points),
            ));
        }
        for (field, value) in [
            ("name", &self.name),
            ("country", &self.country),
            ("avatar", &self.avatar_url),
        ] {
            if value.trim().is_empty() {
                return Err(RankError::remote(service, format!("empty `{field}` in response")));
            }
        }
        Ok(self)
    }
}

// ---------------------------------------------------------------------------
// Ranked leaderboard listing (ScoreSaber)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LeaderboardPage {
    pub leaderboards: Vec<LeaderboardInfo>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardInfo {
    pub song_hash: String,
    pub song_name: String,
    pub level_author_name: String,
    pub difficulty: LeaderboardDifficulty,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardDifficulty {
    /// Numeric code (1, 3, 5, 7, 9) or a difficulty name.
    pub difficulty: DifficultyValue,
    pub difficulty_raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DifficultyValue {
    Code(u8),
    Name(String),
}

// ---------------------------------------------------------------------------
// RankClient
// ---------------------------------------------------------------------------

/// HTTP client for both ranking services. Cheap to clone.
#[derive(Debug, Clone)]
pub struct RankClient {
    http: reqwest::Client,
    scoresaber_api: String,
    beatleader_api: String,
}

impl RankClient {
    pub fn new(
        http: reqwest::Client,
        scoresaber_api: impl Into<String>,
        beatleader_api: impl Into<String>,
    ) -> Self {
        Self {
            http,
            scoresaber_api: scoresaber_api.into().trim_end_matches('/').to_string(),
            beatleader_api: beatleader_api.into().trim_end_matches('/').to_string(),
        }
    }

    /// Look up a player's profile. Exactly one GET, no retry.
    pub async fn fetch_player_info(
        &self,
        platform: Platform,
        player_id: &str,
    ) -> Result<PlayerInfo, RankError> {
        let service = platform.label();
        let id = encode_segment(player_id);
        let player: PlayerInfo = match platform {
            Platform::ScoreSaber => self
                .get_json::<ScoreSaberPlayer>(
                    service,
                    &format!("{}/player/{}/basic", self.scoresaber_api, id),
                    &[],
                )
                .await?
                .into(),
            Platform::BeatLeader => self
                .get_json::<BeatLeaderPlayer>(
                    service,
                    &format!("{}/player/{}", self.beatleader_api, id),
                    &[],
                )
                .await?
                .into(),
        };
        player.validate(service)
    }

    /// One page of ranked ScoreSaber leaderboards.
    pub async fn ranked_leaderboards(
        &self,
        page: u32,
        limit: u32,
    ) -> Result<Vec<LeaderboardInfo>, RankError> {
        let page = page.to_string();
        let limit = limit.to_string();
        let listing: LeaderboardPage = self
            .get_json(
                Platform::ScoreSaber.label(),
                &format!("{}/leaderboards", self.scoresaber_api),
                &[("ranked", "true"), ("page", page.as_str()), ("limit", limit.as_str())],
            )
            .await?;
        Ok(listing.leaderboards)
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        service: &'static str,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<T, RankError> {
        debug!(service, url, "ranking service request");
        let resp = self
            .http
            .get(url)
            .query(query)
            .send()
            .await
            .map_err(|e| RankError::remote(service, e))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(RankError::remote(service, format!("HTTP {}", status)));
        }

        let bytes = resp.bytes().await.map_err(|e| RankError::remote(service, e))?;
        serde_json::from_slice(&bytes)
            .map_err(|e| RankError::remote(service, format!("unexpected response: {}", e)))
    }
}

/// Percent-encode a user-supplied path segment.
fn encode_segment(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.trim().as_bytes()).collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> RankClient {
        RankClient::new(reqwest::Client::new(), server.uri(), server.uri())
    }

    // -- Platform -----------------------------------------------------------

    #[test]
    fn platform_parse_is_case_insensitive() {
        assert_eq!("ScoreSaber".parse::<Platform>().unwrap(), Platform::ScoreSaber);
        assert_eq!("BEATLEADER".parse::<Platform>().unwrap(), Platform::BeatLeader);
        assert_eq!(" beatleader ".parse::<Platform>().unwrap(), Platform::BeatLeader);
    }

    #[test]
    fn unknown_platform_is_usage_error() {
        match "osu".parse::<Platform>() {
            Err(RankError::UnsupportedPlatform(p)) => assert_eq!(p, "osu"),
            other => panic!("expected UnsupportedPlatform, got {other:?}"),
        }
    }

    #[test]
    fn player_ids_are_path_encoded() {
        assert_eq!(encode_segment("76561198"), "76561198");
        assert_eq!(encode_segment("a/b"), "a%2Fb");
    }

    // -- fetch_player_info --------------------------------------------------

    #[tokio::test]
    async fn scoresaber_player_is_normalised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/player/76561198/basic"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "76561198",
                "name": "Taichi",
                "profilePicture": "https://cdn.scoresaber.com/avatars/76561198.jpg",
                "country": "JP",
                "pp": 17345.12,
                "rank": 3,
                "countryRank": 1
            })))
            .expect(1)
            .mount(&server)
            .await;

        let info = client(&server)
            .fetch_player_info(Platform::ScoreSaber, "76561198")
            .await
            .unwrap();
        assert_eq!(info.name, "Taichi");
        assert_eq!(info.global_rank, 3);
        assert_eq!(info.country, "JP");
        assert_eq!(info.avatar_url, "https://cdn.scoresaber.com/avatars/76561198.jpg");
        assert!(info.performance_points >= 0.0);
    }

    #[tokio::test]
    async fn beatleader_player_is_normalised() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/player/123"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "123",
                "name": "bl_player",
                "avatar": "https://cdn.assets.beatleader.xyz/123.png",
                "country": "DE",
                "pp": 12000.5,
                "globalRank": 42
            })))
            .mount(&server)
            .await;

        let info = client(&server)
            .fetch_player_info(Platform::BeatLeader, "123")
            .await
            .unwrap();
        assert_eq!(info.global_rank, 42);
        assert_eq!(info.avatar_url, "https://cdn.assets.beatleader.xyz/123.png");
    }

    #[tokio::test]
    async fn beatleader_plain_rank_field_is_accepted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/player/7"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "p", "avatar": "a", "country": "US", "pp": 1.0, "rank": 9
            })))
            .mount(&server)
            .await;

        let info = client(&server)
            .fetch_player_info(Platform::BeatLeader, "7")
            .await
            .unwrap();
        assert_eq!(info.global_rank, 9);
    }

    #[tokio::test]
    async fn server_error_is_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_player_info(Platform::ScoreSaber, "1")
            .await
            .unwrap_err();
        match err {
            RankError::RemoteLookupFailed { service, reason } => {
                assert_eq!(service, "ScoreSaber");
                assert!(reason.contains("500"), "reason: {reason}");
            }
            other => panic!("expected RemoteLookupFailed, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn missing_field_is_remote_failure() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "name": "x" })))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_player_info(Platform::ScoreSaber, "1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("missing field"), "{err}");
    }

    #[tokio::test]
    async fn negative_rank_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "name": "x", "profilePicture": "a", "country": "US", "pp": 1.0, "rank": -1
            })))
            .mount(&server)
            .await;

        assert!(client(&server)
            .fetch_player_info(Platform::ScoreSaber, "1")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn network_failure_is_remote_failure() {
        // Nothing listens on port 9 on the loopback interface.
        let client = RankClient::new(
            reqwest::Client::new(),
            "http://127.0.0.1:9",
            "http://127.0.0.1:9",
        );
        let err = client
            .fetch_player_info(Platform::BeatLeader, "1")
            .await
            .unwrap_err();
        assert!(matches!(err, RankError::RemoteLookupFailed { service: "BeatLeader", .. }));
    }

    // -- ranked_leaderboards ------------------------------------------------

    #[tokio::test]
    async fn leaderboard_listing_requests_ranked_page() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/leaderboards"))
            .and(query_param("ranked", "true"))
            .and(query_param("page", "1"))
            .and(query_param("limit", "50"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "leaderboards": [{
                    "id": 1,
                    "songHash": "abc123",
                    "songName": "Song A",
                    "songAuthorName": "Artist",
                    "levelAuthorName": "Mapper",
                    "difficulty": { "leaderboardId": 1, "difficulty": 9, "gameMode": "SoloStandard", "difficultyRaw": "_ExpertPlus_SoloStandard" },
                    "ranked": true
                }],
                "metadata": { "total": 1, "page": 1, "itemsPerPage": 50 }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let boards = client(&server).ranked_leaderboards(1, 50).await.unwrap();
        assert_eq!(boards.len(), 1);
        assert_eq!(boards[0].song_name, "Song A");
        assert_eq!(boards[0].difficulty.difficulty, DifficultyValue::Code(9));
    }
}

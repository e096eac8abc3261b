//! Core catalog model shared by the import pipeline crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cardsync-core";

/// One supported trading-card game line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CardGameType {
    Pokemon,
    OnePiece,
    Magic,
    #[serde(rename = "yugioh")]
    YuGiOh,
    Digimon,
    Lorcana,
    Riftbound,
}

impl CardGameType {
    /// Fixed iteration order used by a full import cycle.
    pub const ALL: [CardGameType; 7] = [
        CardGameType::Pokemon,
        CardGameType::OnePiece,
        CardGameType::Magic,
        CardGameType::YuGiOh,
        CardGameType::Digimon,
        CardGameType::Lorcana,
        CardGameType::Riftbound,
    ];

    pub fn display_name(self) -> &'static str {
        match self {
            CardGameType::Pokemon => "Pokemon",
            CardGameType::OnePiece => "One Piece",
            CardGameType::Magic => "Magic: The Gathering",
            CardGameType::YuGiOh => "Yu-Gi-Oh!",
            CardGameType::Digimon => "Digimon",
            CardGameType::Lorcana => "Disney Lorcana",
            CardGameType::Riftbound => "Riftbound",
        }
    }

    /// Stable identifier used in config files, the CLI and database rows.
    pub fn slug(self) -> &'static str {
        match self {
            CardGameType::Pokemon => "pokemon",
            CardGameType::OnePiece => "one_piece",
            CardGameType::Magic => "magic",
            CardGameType::YuGiOh => "yugioh",
            CardGameType::Digimon => "digimon",
            CardGameType::Lorcana => "lorcana",
            CardGameType::Riftbound => "riftbound",
        }
    }
}

impl fmt::Display for CardGameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.slug())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown card game type '{0}'")]
pub struct ParseGameTypeError(pub String);

impl FromStr for CardGameType {
    type Err = ParseGameTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        CardGameType::ALL
            .into_iter()
            .find(|g| g.slug() == needle || g.display_name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| ParseGameTypeError(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportMode {
    /// Re-scan the provider feed from offset 0.
    Full,
    /// Continue from the stored cursor.
    Delta,
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Full => f.write_str("full"),
            ImportMode::Delta => f.write_str("delta"),
        }
    }
}

impl FromStr for ImportMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "full" => Ok(ImportMode::Full),
            "delta" => Ok(ImportMode::Delta),
            other => Err(format!("unknown import mode '{other}' (expected full|delta)")),
        }
    }
}

/// Ordered position in a provider feed.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Cursor(pub u64);

impl Cursor {
    pub const START: Cursor = Cursor(0);

    pub fn offset(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unified rarity scale across card games. Each game uses a subset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Rarity {
    Common,
    Uncommon,
    Rare,
    SuperRare,
    UltraRare,
    SecretRare,
    IllustrationRare,
    SpecialArtRare,
    HyperRare,
    DoubleRare,
    MythicRare,
    Promo,
    Special,
}

impl Rarity {
    /// Maps a provider's free-text rarity onto the unified scale.
    pub fn normalize(raw: &str) -> Rarity {
        let key = raw
            .to_ascii_lowercase()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>();

        match key.as_str() {
            "uncommon" | "u" => Rarity::Uncommon,
            "rare" | "r" | "holorare" | "rareholo" => Rarity::Rare,
            "superrare" | "sr" => Rarity::SuperRare,
            "ultrarare" | "ur" => Rarity::UltraRare,
            "secretrare" | "sec" | "secret" => Rarity::SecretRare,
            "illustrationrare" | "ir" => Rarity::IllustrationRare,
            "specialillustrationrare" | "specialartrare" | "sar" | "sir" => {
                Rarity::SpecialArtRare
            }
            "hyperrare" => Rarity::HyperRare,
            "doublerare" | "rr" => Rarity::DoubleRare,
            "mythic" | "mythicrare" | "m" => Rarity::MythicRare,
            "promo" | "p" => Rarity::Promo,
            "special" | "s" => Rarity::Special,
            _ => Rarity::Common,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Rarity::Common => "COMMON",
            Rarity::Uncommon => "UNCOMMON",
            Rarity::Rare => "RARE",
            Rarity::SuperRare => "SUPER_RARE",
            Rarity::UltraRare => "ULTRA_RARE",
            Rarity::SecretRare => "SECRET_RARE",
            Rarity::IllustrationRare => "ILLUSTRATION_RARE",
            Rarity::SpecialArtRare => "SPECIAL_ART_RARE",
            Rarity::HyperRare => "HYPER_RARE",
            Rarity::DoubleRare => "DOUBLE_RARE",
            Rarity::MythicRare => "MYTHIC_RARE",
            Rarity::Promo => "PROMO",
            Rarity::Special => "SPECIAL",
        }
    }
}

impl FromStr for Rarity {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Rarity::normalize(s))
    }
}

/// Identity of a catalog record within one card game.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NaturalKey {
    pub game: CardGameType,
    pub name: String,
    pub set_code: String,
    pub card_number: String,
}

impl fmt::Display for NaturalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{}/{}#{}",
            self.game, self.set_code, self.card_number, self.name
        )
    }
}

/// Normalized record produced by a source reader. Never persisted directly.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateRecord {
    pub game: CardGameType,
    pub name: String,
    pub set_code: String,
    pub card_number: String,
    pub rarity: Rarity,
    pub image_url: Option<String>,
    /// Free text; may embed an `[Expansion: <name>]` tag.
    pub description: Option<String>,
    pub mana_cost: Option<i32>,
    pub created_at: Option<DateTime<Utc>>,
}

impl CandidateRecord {
    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            game: self.game,
            name: self.name.clone(),
            set_code: self.set_code.clone(),
            card_number: self.card_number.clone(),
        }
    }
}

/// Reference entity identified by (title, game).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expansion {
    pub id: Uuid,
    pub title: String,
    pub game: CardGameType,
}

impl Expansion {
    pub fn new(title: impl Into<String>, game: CardGameType) -> Self {
        Self {
            id: Uuid::new_v4(),
            title: title.into(),
            game,
        }
    }
}

/// Durable catalog entity keyed by [`NaturalKey`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CatalogRecord {
    pub id: Uuid,
    pub game: CardGameType,
    pub name: String,
    pub set_code: String,
    pub card_number: String,
    pub rarity: Rarity,
    pub image_url: Option<String>,
    pub description: Option<String>,
    pub mana_cost: Option<i32>,
    pub expansion_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl CatalogRecord {
    /// Builds a not-yet-persisted record from a candidate.
    pub fn from_candidate(candidate: CandidateRecord, expansion: Option<&Expansion>) -> Self {
        Self {
            id: Uuid::new_v4(),
            game: candidate.game,
            name: candidate.name,
            set_code: candidate.set_code,
            card_number: candidate.card_number,
            rarity: candidate.rarity,
            image_url: candidate.image_url,
            description: candidate.description,
            mana_cost: candidate.mana_cost,
            expansion_id: expansion.map(|e| e.id),
            created_at: candidate.created_at.unwrap_or_else(Utc::now),
        }
    }

    pub fn natural_key(&self) -> NaturalKey {
        NaturalKey {
            game: self.game,
            name: self.name.clone(),
            set_code: self.set_code.clone(),
            card_number: self.card_number.clone(),
        }
    }
}

/// Per-game import cursor row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportProgress {
    pub game: CardGameType,
    pub cursor: Cursor,
    /// Set when the last clean sweep ended on the provider's exhaustion signal.
    pub complete: bool,
    pub last_run_at: DateTime<Utc>,
}

/// Named mutual-exclusion token with a time-to-live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLock {
    pub name: String,
    pub holder_id: String,
    pub acquired_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl RunLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TypeRunStatus {
    InProgress,
    Success,
    Failed,
    NotAttempted,
}

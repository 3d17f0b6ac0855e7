//! Voice selection.
//!
//! Filters a backend's voice catalog down to the configured locales (or
//! explicitly named voices) and ranks what is left by a small quality
//! heuristic. The catalog can arrive late, so the selector follows a `watch`
//! channel and republishes its ranking to its own subscribers.

use crate::synthesis::VoiceInfo;
use crate::{NarratorError, Result};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Filter and scoring preferences
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct VoicePreferences {
    /// Locale tags a voice may match (substring, case-insensitive)
    pub locales: Vec<String>,
    /// Voice names accepted regardless of locale
    pub include_names: Vec<String>,
    /// Names that earn `preferred_bonus`
    pub preferred_names: Vec<String>,
    /// Name markers for high-quality voices, earning `quality_bonus`
    pub quality_markers: Vec<String>,
    pub preferred_bonus: u32,
    pub quality_bonus: u32,
}

fn env_list(key: &str, default: &str) -> Vec<String> {
    std::env::var(key)
        .unwrap_or_else(|_| default.to_string())
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl Default for VoicePreferences {
    fn default() -> Self {
        Self {
            locales: env_list("NARRATOR_VOICE_LOCALES", "zh-TW,zh-HK"),
            include_names: env_list("NARRATOR_VOICE_NAMES", "Meijia,Sin-ji"),
            preferred_names: env_list("NARRATOR_VOICE_PREFERRED", "Meijia"),
            quality_markers: env_list("NARRATOR_VOICE_QUALITY", "Enhanced,Premium"),
            preferred_bonus: 2,
            quality_bonus: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoiceCandidate {
    pub id: String,
    pub name: String,
    pub locale: String,
    pub quality_score: u32,
}

/// Ranked candidates plus the current selection
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VoiceRanking {
    pub candidates: Vec<VoiceCandidate>,
    pub selected: Option<String>,
    /// True when the selection came from the caller rather than the ranking
    pub explicit: bool,
}

impl VoiceRanking {
    pub fn current(&self) -> Option<&VoiceCandidate> {
        let id = self.selected.as_deref()?;
        self.candidates.iter().find(|c| c.id == id)
    }
}

fn normalize_locale(tag: &str) -> String {
    tag.to_lowercase().replace('_', "-")
}

fn locale_matches(prefs: &VoicePreferences, voice: &VoiceInfo) -> bool {
    let locale = normalize_locale(&voice.locale);
    prefs
        .locales
        .iter()
        .any(|l| locale.contains(&normalize_locale(l)))
}

fn name_listed(names: &[String], voice: &VoiceInfo) -> bool {
    names.iter().any(|n| voice.name.contains(n.as_str()))
}

/// Filter `catalog` by locale/name and sort by score, descending. Ties keep
/// catalog order.
pub fn rank_voices(catalog: &[VoiceInfo], prefs: &VoicePreferences) -> Vec<VoiceCandidate> {
    let mut ranked: Vec<VoiceCandidate> = catalog
        .iter()
        .filter(|v| locale_matches(prefs, v) || name_listed(&prefs.include_names, v))
        .map(|v| {
            let mut score = 0;
            if name_listed(&prefs.preferred_names, v) {
                score += prefs.preferred_bonus;
            }
            if name_listed(&prefs.quality_markers, v) {
                score += prefs.quality_bonus;
            }
            VoiceCandidate {
                id: v.id.clone(),
                name: v.name.clone(),
                locale: v.locale.clone(),
                quality_score: score,
            }
        })
        .collect();
    // stable sort
    ranked.sort_by(|a, b| b.quality_score.cmp(&a.quality_score));
    ranked
}

pub struct VoiceSelector {
    prefs: VoicePreferences,
    tx: watch::Sender<VoiceRanking>,
}

impl VoiceSelector {
    pub fn new(prefs: VoicePreferences) -> Self {
        let (tx, _rx) = watch::channel(VoiceRanking::default());
        Self { prefs, tx }
    }

    /// Recompute the ranking from a fresh catalog.
    ///
    /// An explicit choice survives while the catalog still offers it;
    /// otherwise the top-ranked voice becomes the default.
    pub fn update_catalog(&self, catalog: &[VoiceInfo]) {
        let candidates = rank_voices(catalog, &self.prefs);
        self.tx.send_modify(|ranking| {
            let keep = ranking.explicit
                && ranking
                    .selected
                    .as_ref()
                    .map(|id| candidates.iter().any(|c| &c.id == id))
                    .unwrap_or(false);
            if !keep {
                if ranking.explicit {
                    warn!(
                        target = "voice",
                        voice = ?ranking.selected,
                        "Selected voice left the catalog; falling back to best match"
                    );
                }
                ranking.selected = candidates.first().map(|c| c.id.clone());
                ranking.explicit = false;
            }
            ranking.candidates = candidates;
        });
        let ranking = self.tx.borrow();
        info!(
            target = "voice",
            catalog = catalog.len(),
            candidates = ranking.candidates.len(),
            selected = ?ranking.selected,
            "Voice ranking updated"
        );
    }

    /// Choose a voice explicitly
    pub fn select(&self, id: &str) -> Result<()> {
        if !self.tx.borrow().candidates.iter().any(|c| c.id == id) {
            return Err(NarratorError::UnknownVoice(id.to_string()));
        }
        self.tx.send_modify(|ranking| {
            ranking.selected = Some(id.to_string());
            ranking.explicit = true;
        });
        debug!(target = "voice", voice = id, "Voice selected");
        Ok(())
    }

    pub fn current(&self) -> Option<VoiceCandidate> {
        self.tx.borrow().current().cloned()
    }

    pub fn ranked(&self) -> Vec<VoiceCandidate> {
        self.tx.borrow().candidates.clone()
    }

    pub fn snapshot(&self) -> VoiceRanking {
        self.tx.borrow().clone()
    }

    /// Subscribe to ranking changes instead of polling
    pub fn subscribe(&self) -> watch::Receiver<VoiceRanking> {
        self.tx.subscribe()
    }

    /// Track a backend catalog: rank what is there now, then re-rank on every
    /// change until the catalog sender goes away.
    pub fn follow(self: &Arc<Self>, mut catalog: watch::Receiver<Vec<VoiceInfo>>) -> JoinHandle<()> {
        let selector = Arc::clone(self);
        tokio::spawn(async move {
            let initial = catalog.borrow_and_update().clone();
            selector.update_catalog(&initial);
            while catalog.changed().await.is_ok() {
                let voices = catalog.borrow_and_update().clone();
                selector.update_catalog(&voices);
            }
            debug!(target = "voice", "Voice catalog closed");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voice(id: &str, name: &str, locale: &str) -> VoiceInfo {
        VoiceInfo {
            id: id.into(),
            name: name.into(),
            locale: locale.into(),
        }
    }

    fn prefs() -> VoicePreferences {
        VoicePreferences {
            locales: vec!["zh-TW".into(), "zh-HK".into()],
            include_names: vec!["Meijia".into(), "Sin-ji".into()],
            preferred_names: vec!["Meijia".into()],
            quality_markers: vec!["Enhanced".into()],
            preferred_bonus: 2,
            quality_bonus: 1,
        }
    }

    fn catalog() -> Vec<VoiceInfo> {
        vec![
            voice("samantha", "Samantha", "en-US"),
            voice("sinji", "Sin-ji", "yue"),
            voice("tingting", "Tingting (Enhanced)", "zh_TW"),
            voice("meijia", "Meijia", "zh-TW"),
            voice("meijia-e", "Meijia (Enhanced)", "zh-TW"),
        ]
    }

    #[test]
    fn test_rank_filters_and_orders() {
        let ranked = rank_voices(&catalog(), &prefs());
        let ids: Vec<_> = ranked.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec!["meijia-e", "meijia", "tingting", "sinji"]);
        assert_eq!(ranked[0].quality_score, 3);
        assert_eq!(ranked[3].quality_score, 0);
    }

    #[test]
    fn test_default_selection_is_top_ranked() {
        let selector = VoiceSelector::new(prefs());
        assert!(selector.current().is_none());
        selector.update_catalog(&catalog());
        assert_eq!(selector.current().map(|c| c.id), Some("meijia-e".into()));
    }

    #[test]
    fn test_explicit_choice_survives_recompute() {
        let selector = VoiceSelector::new(prefs());
        selector.update_catalog(&catalog());
        selector.select("sinji").unwrap();
        selector.update_catalog(&catalog());
        assert_eq!(selector.current().map(|c| c.id), Some("sinji".into()));

        // gone from the catalog -> best match again
        let reduced: Vec<_> = catalog().into_iter().filter(|v| v.id != "sinji").collect();
        selector.update_catalog(&reduced);
        assert_eq!(selector.current().map(|c| c.id), Some("meijia-e".into()));
        assert!(!selector.snapshot().explicit);
    }

    #[test]
    fn test_select_unknown_voice() {
        let selector = VoiceSelector::new(prefs());
        selector.update_catalog(&catalog());
        assert!(matches!(
            selector.select("samantha"),
            Err(NarratorError::UnknownVoice(_))
        ));
    }

    #[tokio::test]
    async fn test_follow_reranks_when_catalog_arrives() {
        let selector = Arc::new(VoiceSelector::new(prefs()));
        let mut rankings = selector.subscribe();
        let (tx, rx) = watch::channel(Vec::new());
        let _task = selector.follow(rx);

        rankings.changed().await.unwrap();
        assert!(rankings.borrow_and_update().candidates.is_empty());

        tx.send(catalog()).unwrap();
        rankings.changed().await.unwrap();
        assert_eq!(
            rankings.borrow().selected.as_deref(),
            Some("meijia-e")
        );
    }
}

//! Voice catalog: which personas each engine can speak with.
//!
//! - Native voices come from the platform speech service and may show up
//!   late; [`VoiceCatalog::await_ready`] bounds the wait.
//! - Neural voices are a hand-maintained table of the synthesis service's
//!   voice identifiers.
//! - Offline voices are the configured espeak languages.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::native::SpeechPlatform;

/// Which synthesis engine a voice (or backend) belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    Native,
    Neural,
    Offline,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Neural => write!(f, "neural"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

impl FromStr for EngineKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "native" | "browser" | "system" => Ok(Self::Native),
            "neural" | "remote" | "premium" => Ok(Self::Neural),
            "offline" | "espeak" => Ok(Self::Offline),
            other => Err(format!("unknown engine: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Female,
    Male,
}

/// A synthesis persona. Read-only once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Voice {
    pub id: String,
    pub label: String,
    pub language: String,
    pub engine: EngineKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub style: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gender: Option<Gender>,
}

impl Voice {
    pub fn native(id: impl Into<String>, language: impl Into<String>) -> Self {
        let id = id.into();
        let language = language.into();
        Self {
            label: format!("{id} ({language})"),
            id,
            language,
            engine: EngineKind::Native,
            style: None,
            gender: None,
        }
    }

    pub fn offline(language: impl Into<String>) -> Self {
        let language = language.into();
        Self {
            id: language.clone(),
            label: format!("eSpeak ({language})"),
            language,
            engine: EngineKind::Offline,
            style: None,
            gender: None,
        }
    }
}

// (id, name, locale, gender, style)
const NEURAL_TABLE: &[(&str, &str, &str, Gender, &str)] = &[
    ("en-US-AriaNeural", "Aria", "en-US", Gender::Female, "friendly"),
    ("en-US-GuyNeural", "Guy", "en-US", Gender::Male, "newscast"),
    ("en-US-JennyNeural", "Jenny", "en-US", Gender::Female, "assistant"),
    ("en-US-DavisNeural", "Davis", "en-US", Gender::Male, "calm"),
    ("en-US-AmberNeural", "Amber", "en-US", Gender::Female, "warm"),
    ("en-US-AnaNeural", "Ana", "en-US", Gender::Female, "child"),
    ("en-US-BrandonNeural", "Brandon", "en-US", Gender::Male, "conversational"),
    ("en-US-ChristopherNeural", "Christopher", "en-US", Gender::Male, "reliable"),
    ("en-US-CoraNeural", "Cora", "en-US", Gender::Female, "positive"),
    ("en-US-ElizabethNeural", "Elizabeth", "en-US", Gender::Female, "elegant"),
    ("en-US-EricNeural", "Eric", "en-US", Gender::Male, "rational"),
    ("en-US-JacobNeural", "Jacob", "en-US", Gender::Male, "casual"),
    ("en-US-MichelleNeural", "Michelle", "en-US", Gender::Female, "friendly"),
    ("en-US-MonicaNeural", "Monica", "en-US", Gender::Female, "professional"),
    ("en-US-SaraNeural", "Sara", "en-US", Gender::Female, "cheerful"),
    ("en-GB-SoniaNeural", "Sonia", "en-GB", Gender::Female, "professional"),
    ("en-GB-RyanNeural", "Ryan", "en-GB", Gender::Male, "cheerful"),
    ("en-GB-LibbyNeural", "Libby", "en-GB", Gender::Female, "warm"),
    ("en-GB-ThomasNeural", "Thomas", "en-GB", Gender::Male, "calm"),
    ("en-AU-NatashaNeural", "Natasha", "en-AU", Gender::Female, "friendly"),
    ("en-AU-WilliamNeural", "William", "en-AU", Gender::Male, "conversational"),
    ("es-ES-ElviraNeural", "Elvira", "es-ES", Gender::Female, "standard"),
    ("es-ES-AlvaroNeural", "Alvaro", "es-ES", Gender::Male, "standard"),
    ("es-MX-DaliaNeural", "Dalia", "es-MX", Gender::Female, "standard"),
    ("es-MX-JorgeNeural", "Jorge", "es-MX", Gender::Male, "standard"),
    ("fr-FR-DeniseNeural", "Denise", "fr-FR", Gender::Female, "standard"),
    ("fr-FR-HenriNeural", "Henri", "fr-FR", Gender::Male, "standard"),
    ("de-DE-KatjaNeural", "Katja", "de-DE", Gender::Female, "standard"),
    ("de-DE-ConradNeural", "Conrad", "de-DE", Gender::Male, "standard"),
    ("it-IT-ElsaNeural", "Elsa", "it-IT", Gender::Female, "standard"),
    ("it-IT-DiegoNeural", "Diego", "it-IT", Gender::Male, "standard"),
    ("pt-BR-FranciscaNeural", "Francisca", "pt-BR", Gender::Female, "standard"),
    ("pt-BR-AntonioNeural", "Antonio", "pt-BR", Gender::Male, "standard"),
    ("zh-CN-XiaoxiaoNeural", "Xiaoxiao", "zh-CN", Gender::Female, "standard"),
    ("zh-CN-YunxiNeural", "Yunxi", "zh-CN", Gender::Male, "standard"),
    ("ja-JP-NanamiNeural", "Nanami", "ja-JP", Gender::Female, "standard"),
    ("ja-JP-KeitaNeural", "Keita", "ja-JP", Gender::Male, "standard"),
    ("ko-KR-SunHiNeural", "SunHi", "ko-KR", Gender::Female, "standard"),
    ("ko-KR-InJoonNeural", "InJoon", "ko-KR", Gender::Male, "standard"),
];

/// Native voice names that sound best; listed first.
const PREFERRED_NATIVE: &[&str] = &[
    "Samantha", "Alex", "Daniel", "Serena", "Moira", "Karen", "Russell", "Thomas", "Audrey",
    "Hans", "Marlene", "Alice", "Luca",
];

/// All neural voices the synthesis service offers.
pub fn neural_voices() -> Vec<Voice> {
    NEURAL_TABLE
        .iter()
        .map(|&(id, name, locale, gender, style)| Voice {
            id: id.to_string(),
            label: format!(
                "{name} ({})",
                match gender {
                    Gender::Female => "Female",
                    Gender::Male => "Male",
                }
            ),
            language: locale.to_string(),
            engine: EngineKind::Neural,
            style: Some(style.to_string()),
            gender: Some(gender),
        })
        .collect()
}

/// Neural voices for a language tag.
///
/// Exact locale first (`en-GB`), then the language prefix (`es` matches
/// `es-ES` and `es-MX`), then the en-US list.
pub fn neural_voices_for(lang: &str) -> Vec<Voice> {
    let all = neural_voices();
    let exact: Vec<Voice> = all
        .iter()
        .filter(|v| v.language.eq_ignore_ascii_case(lang))
        .cloned()
        .collect();
    if !exact.is_empty() {
        return exact;
    }

    let prefix = lang.split(['-', '_']).next().unwrap_or(lang);
    let by_language: Vec<Voice> = all
        .iter()
        .filter(|v| {
            v.language
                .split('-')
                .next()
                .is_some_and(|l| l.eq_ignore_ascii_case(prefix))
        })
        .cloned()
        .collect();
    if !by_language.is_empty() {
        return by_language;
    }

    all.into_iter().filter(|v| v.language == "en-US").collect()
}

pub struct VoiceCatalog {
    native: Option<Arc<dyn SpeechPlatform>>,
    offline: Vec<Voice>,
    excluded: Vec<String>,
}

impl VoiceCatalog {
    pub fn new(
        native: Option<Arc<dyn SpeechPlatform>>,
        offline_languages: &[String],
        excluded: Vec<String>,
    ) -> Self {
        Self {
            native,
            offline: offline_languages.iter().map(Voice::offline).collect(),
            excluded,
        }
    }

    /// Voices currently known for an engine.
    pub fn list_voices(&self, engine: EngineKind) -> Vec<Voice> {
        match engine {
            EngineKind::Native => match &self.native {
                Some(platform) => self.filter_native(platform.voices()),
                None => Vec::new(),
            },
            EngineKind::Neural => neural_voices(),
            EngineKind::Offline => self.offline.clone(),
        }
    }

    pub fn has_voices(&self, engine: EngineKind) -> bool {
        !self.list_voices(engine).is_empty()
    }

    /// Look up a voice by id across all engines.
    pub fn find(&self, id: &str) -> Option<Voice> {
        [EngineKind::Neural, EngineKind::Native, EngineKind::Offline]
            .into_iter()
            .flat_map(|engine| self.list_voices(engine))
            .find(|v| v.id == id)
    }

    /// Wait until an engine has voices, or `timeout` passes.
    ///
    /// Native enumeration: try the snapshot, prime the service with a
    /// near-silent utterance, then race the change notification against
    /// the timeout. Resolves with whatever is available at that point.
    pub async fn await_ready(&self, engine: EngineKind, timeout: Duration) -> bool {
        if engine != EngineKind::Native {
            return self.has_voices(engine);
        }
        let Some(platform) = &self.native else {
            return false;
        };

        if self.has_voices(EngineKind::Native) {
            return true;
        }

        debug!("No native voices yet, priming {}", platform.name());
        platform.prime().await;

        let deadline = tokio::time::sleep(timeout);
        tokio::pin!(deadline);
        loop {
            if self.has_voices(EngineKind::Native) {
                break;
            }
            tokio::select! {
                _ = platform.voices_changed() => {}
                _ = &mut deadline => break,
            }
        }

        let count = self.list_voices(EngineKind::Native).len();
        info!("Native voices ready: {count}");
        count > 0
    }

    fn filter_native(&self, voices: Vec<Voice>) -> Vec<Voice> {
        let mut kept: Vec<Voice> = voices
            .into_iter()
            .filter(|v| !self.excluded.iter().any(|name| names_voice(&v.id, name)))
            .collect();
        // Stable sort keeps platform order within each group.
        kept.sort_by_key(|v| !PREFERRED_NATIVE.contains(&v.id.as_str()));
        kept
    }
}

/// Whether `name` appears in `id` as a whole word ("Flo (English)" but not
/// "Florence").
fn names_voice(id: &str, name: &str) -> bool {
    if name.is_empty() {
        return false;
    }
    id.match_indices(name).any(|(at, _)| {
        let before = id[..at].chars().next_back();
        let after = id[at + name.len()..].chars().next();
        !before.is_some_and(char::is_alphanumeric) && !after.is_some_and(char::is_alphanumeric)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::Instant;

    use crate::error::PlatformError;
    use crate::narrator::backend::native::{Utterance, UtteranceEvents};

    /// A speech service whose voice list the test controls.
    struct ScriptedPlatform {
        voices: Mutex<Vec<Voice>>,
        /// Voices that show up once the service has been primed.
        after_prime: Mutex<Option<(Duration, Vec<Voice>)>>,
        changed: Notify,
        primed: Mutex<u32>,
    }

    impl ScriptedPlatform {
        fn new(voices: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                voices: Mutex::new(voices.iter().map(|id| Voice::native(*id, "en-US")).collect()),
                after_prime: Mutex::new(None),
                changed: Notify::new(),
                primed: Mutex::new(0),
            })
        }

        fn late(delay: Duration, voices: &[&str]) -> Arc<Self> {
            let platform = Self::new(&[]);
            *platform.after_prime.lock().unwrap() = Some((
                delay,
                voices.iter().map(|id| Voice::native(*id, "en-US")).collect(),
            ));
            platform
        }
    }

    #[async_trait]
    impl SpeechPlatform for ScriptedPlatform {
        fn name(&self) -> &str {
            "scripted"
        }
        fn voices(&self) -> Vec<Voice> {
            self.voices.lock().unwrap().clone()
        }
        async fn voices_changed(&self) {
            self.changed.notified().await
        }
        async fn prime(&self) {
            *self.primed.lock().unwrap() += 1;
        }
        async fn utter(&self, _utterance: Utterance) -> Result<UtteranceEvents, PlatformError> {
            Err(PlatformError::Unavailable("not speaking in catalog tests".into()))
        }
        fn pause(&self) {}
        fn resume(&self) {}
        fn cancel(&self) {}
    }

    /// Publish the post-prime voices after their delay, as a warming-up
    /// service would.
    fn spawn_enumeration(platform: &Arc<ScriptedPlatform>) {
        let platform = platform.clone();
        tokio::spawn(async move {
            loop {
                if *platform.primed.lock().unwrap() > 0 {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            let Some((delay, voices)) = platform.after_prime.lock().unwrap().take() else {
                return;
            };
            tokio::time::sleep(delay).await;
            *platform.voices.lock().unwrap() = voices;
            platform.changed.notify_waiters();
        });
    }

    fn catalog(platform: &Arc<ScriptedPlatform>, excluded: &[&str]) -> VoiceCatalog {
        VoiceCatalog::new(
            Some(platform.clone() as Arc<dyn SpeechPlatform>),
            &[],
            excluded.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn native_voices_that_appear_after_priming_are_awaited() {
        let platform = ScriptedPlatform::late(Duration::from_millis(300), &["Alex", "Karen"]);
        spawn_enumeration(&platform);
        let catalog = catalog(&platform, &[]);
        assert!(!catalog.has_voices(EngineKind::Native));

        let started = Instant::now();
        assert!(catalog.await_ready(EngineKind::Native, Duration::from_secs(2)).await);
        assert_eq!(*platform.primed.lock().unwrap(), 1);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(catalog.list_voices(EngineKind::Native).len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn await_ready_gives_up_at_the_timeout() {
        let platform = ScriptedPlatform::new(&[]);
        let catalog = catalog(&platform, &[]);

        let started = Instant::now();
        assert!(!catalog.await_ready(EngineKind::Native, Duration::from_secs(2)).await);
        let waited = started.elapsed();
        assert!(waited >= Duration::from_secs(2) && waited < Duration::from_millis(2100));
        assert_eq!(*platform.primed.lock().unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn voices_already_listed_skip_priming() {
        let platform = ScriptedPlatform::new(&["Alex"]);
        let catalog = catalog(&platform, &[]);
        assert!(catalog.await_ready(EngineKind::Native, Duration::from_secs(2)).await);
        assert_eq!(*platform.primed.lock().unwrap(), 0);
    }

    #[test]
    fn novelty_voices_are_hidden_and_preferred_voices_come_first() {
        let platform = ScriptedPlatform::new(&[
            "Zarvox",
            "Flo (English (US))",
            "Florence",
            "Bad News",
            "Karen",
            "Jester",
            "Alex",
            "Eddy",
            "Reedville",
        ]);
        let catalog = catalog(&platform, &["Flo", "Bad News", "Jester", "Eddy", "Reed"]);
        let ids: Vec<String> = catalog
            .list_voices(EngineKind::Native)
            .into_iter()
            .map(|v| v.id)
            .collect();
        assert_eq!(ids, ["Karen", "Alex", "Zarvox", "Florence", "Reedville"]);
    }

    #[test]
    fn excluded_names_match_whole_words() {
        assert!(names_voice("Flo", "Flo"));
        assert!(names_voice("Flo (German)", "Flo"));
        assert!(names_voice("en-us Bad News", "Bad News"));
        assert!(!names_voice("Florence", "Flo"));
        assert!(!names_voice("ReedBeck", "Reed"));
        assert!(!names_voice("Alex", ""));
    }

    #[test]
    fn neural_lookup_prefers_exact_locale() {
        let voices = neural_voices_for("en-GB");
        assert_eq!(voices.len(), 4);
        assert!(voices.iter().all(|v| v.language == "en-GB"));
    }

    #[test]
    fn neural_lookup_falls_back_to_language_prefix() {
        let voices = neural_voices_for("es");
        let ids: Vec<&str> = voices.iter().map(|v| v.id.as_str()).collect();
        assert!(ids.contains(&"es-ES-ElviraNeural"));
        assert!(ids.contains(&"es-MX-JorgeNeural"));
    }

    #[test]
    fn neural_lookup_defaults_to_us_english() {
        let voices = neural_voices_for("xx-YY");
        assert!(!voices.is_empty());
        assert!(voices.iter().all(|v| v.language == "en-US"));
    }

    #[test]
    fn neural_voices_carry_metadata() {
        let aria = neural_voices()
            .into_iter()
            .find(|v| v.id == "en-US-AriaNeural")
            .unwrap();
        assert_eq!(aria.label, "Aria (Female)");
        assert_eq!(aria.style.as_deref(), Some("friendly"));
        assert_eq!(aria.engine, EngineKind::Neural);
    }

    #[test]
    fn engine_kind_parses_aliases() {
        assert_eq!("browser".parse::<EngineKind>(), Ok(EngineKind::Native));
        assert_eq!("Remote".parse::<EngineKind>(), Ok(EngineKind::Neural));
        assert_eq!("espeak".parse::<EngineKind>(), Ok(EngineKind::Offline));
        assert!("banana".parse::<EngineKind>().is_err());
    }

    #[test]
    fn offline_catalog_lists_configured_languages() {
        let catalog = VoiceCatalog::new(None, &["en".into(), "fr".into()], Vec::new());
        let voices = catalog.list_voices(EngineKind::Offline);
        assert_eq!(voices.len(), 2);
        assert_eq!(catalog.find("fr").map(|v| v.engine), Some(EngineKind::Offline));
        assert!(!catalog.has_voices(EngineKind::Native));
    }
}

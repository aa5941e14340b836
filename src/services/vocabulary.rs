// src/services/vocabulary.rs

//! Keyword vocabularies used to enrich parsed records.
//!
//! Every lookup goes through an ordered list of `(tag, keywords)` matchers;
//! the first tag with a matching keyword wins and a fixed fallback applies
//! when nothing matches. Order matters: `Metal` is checked before `Rock` so
//! "black metal" is not filed under rock.

use unicode_segmentation::UnicodeSegmentation;

/// Genre families with a known trait profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GenreFamily {
    Electronic,
    Metal,
    Rock,
    HipHop,
    Jazz,
    Blues,
    Classical,
    RnB,
    Pop,
    Folk,
    Country,
    Latin,
    Reggae,
    World,
    Experimental,
    Generic,
}

/// Traits, instruments and moods associated with a genre family.
#[derive(Debug, Clone, Copy)]
pub struct GenreProfile {
    pub traits: &'static [&'static str],
    pub instruments: &'static [&'static str],
    pub moods: &'static [&'static str],
}

const GENRE_MATCHERS: &[(GenreFamily, &[&str])] = &[
    (
        GenreFamily::Electronic,
        &[
            "electronic", "edm", "techno", "house", "trance", "ambient", "synth", "synthwave",
            "dubstep", "drum and bass", "idm", "electro", "downtempo", "garage", "chiptune",
        ],
    ),
    (GenreFamily::Metal, &["metal", "grindcore", "djent", "metalcore"]),
    (
        GenreFamily::Rock,
        &["rock", "punk", "grunge", "shoegaze", "indie", "alternative", "emo", "post-rock"],
    ),
    (
        GenreFamily::HipHop,
        &["hip hop", "hip-hop", "rap", "trap", "drill", "grime", "boom bap"],
    ),
    (GenreFamily::Jazz, &["jazz", "bebop", "swing", "bossa nova", "fusion"]),
    (GenreFamily::Blues, &["blues", "delta", "boogie"]),
    (
        GenreFamily::Classical,
        &["classical", "orchestral", "baroque", "symphonic", "opera", "chamber", "romantic era"],
    ),
    (
        GenreFamily::RnB,
        &["r&b", "rnb", "rhythm and blues", "soul", "funk", "motown", "neo soul"],
    ),
    (
        GenreFamily::Pop,
        &["pop", "synth-pop", "k-pop", "j-pop", "dance-pop", "europop", "bubblegum"],
    ),
    (GenreFamily::Folk, &["folk", "acoustic", "singer-songwriter", "celtic", "bluegrass"]),
    (GenreFamily::Country, &["country", "americana", "honky", "western"]),
    (
        GenreFamily::Latin,
        &["latin", "salsa", "reggaeton", "bachata", "cumbia", "tango", "samba", "bossa"],
    ),
    (GenreFamily::Reggae, &["reggae", "dub", "ska", "dancehall", "rocksteady"]),
    (GenreFamily::World, &["world", "afrobeat", "afrobeats", "traditional", "ethnic", "flamenco"]),
    (
        GenreFamily::Experimental,
        &["experimental", "avant-garde", "noise", "drone", "musique concrete"],
    ),
];

/// Profile for a genre family.
pub fn genre_profile(family: GenreFamily) -> GenreProfile {
    match family {
        GenreFamily::Electronic => GenreProfile {
            traits: &["synthesized", "digital production", "electronic beats", "layered textures"],
            instruments: &["synthesizer", "drum machine", "sampler"],
            moods: &["hypnotic", "atmospheric", "energetic"],
        },
        GenreFamily::Metal => GenreProfile {
            traits: &["distorted guitars", "aggressive", "heavy riffs", "fast drumming"],
            instruments: &["electric guitar", "bass guitar", "double kick drums"],
            moods: &["intense", "dark", "powerful"],
        },
        GenreFamily::Rock => GenreProfile {
            traits: &["guitar-driven", "live drums", "strong backbeat"],
            instruments: &["electric guitar", "bass guitar", "drum kit"],
            moods: &["energetic", "rebellious", "raw"],
        },
        GenreFamily::HipHop => GenreProfile {
            traits: &["rhythmic vocals", "sampled beats", "heavy bass", "rap flow"],
            instruments: &["drum machine", "turntables", "sampler", "808 bass"],
            moods: &["confident", "gritty", "laid-back"],
        },
        GenreFamily::Jazz => GenreProfile {
            traits: &["improvisation", "swing rhythm", "extended harmony"],
            instruments: &["saxophone", "trumpet", "upright bass", "piano"],
            moods: &["smooth", "sophisticated", "relaxed"],
        },
        GenreFamily::Blues => GenreProfile {
            traits: &["blue notes", "twelve-bar form", "call and response"],
            instruments: &["guitar", "harmonica", "piano"],
            moods: &["soulful", "melancholic", "gritty"],
        },
        GenreFamily::Classical => GenreProfile {
            traits: &["orchestral arrangement", "composed structure", "dynamic range"],
            instruments: &["strings", "woodwinds", "brass", "piano"],
            moods: &["majestic", "dramatic", "serene"],
        },
        GenreFamily::RnB => GenreProfile {
            traits: &["groove-based", "soulful vocals", "smooth harmonies"],
            instruments: &["electric piano", "bass guitar", "drums", "horns"],
            moods: &["sensual", "warm", "uplifting"],
        },
        GenreFamily::Pop => GenreProfile {
            traits: &["catchy hooks", "verse-chorus structure", "polished production"],
            instruments: &["synthesizer", "drums", "vocals", "guitar"],
            moods: &["upbeat", "bright", "feel-good"],
        },
        GenreFamily::Folk => GenreProfile {
            traits: &["acoustic instrumentation", "storytelling lyrics", "traditional melodies"],
            instruments: &["acoustic guitar", "fiddle", "banjo", "mandolin"],
            moods: &["earthy", "nostalgic", "intimate"],
        },
        GenreFamily::Country => GenreProfile {
            traits: &["twangy guitars", "narrative lyrics", "simple chord progressions"],
            instruments: &["acoustic guitar", "pedal steel", "fiddle"],
            moods: &["heartfelt", "wistful", "rowdy"],
        },
        GenreFamily::Latin => GenreProfile {
            traits: &["syncopated rhythms", "percussion-heavy", "dance grooves"],
            instruments: &["congas", "timbales", "guitar", "brass"],
            moods: &["passionate", "festive", "sensual"],
        },
        GenreFamily::Reggae => GenreProfile {
            traits: &["offbeat skank", "bass-heavy", "relaxed tempo"],
            instruments: &["bass guitar", "rhythm guitar", "organ", "drums"],
            moods: &["laid-back", "positive", "hypnotic"],
        },
        GenreFamily::World => GenreProfile {
            traits: &["regional scales", "traditional rhythms", "cultural instrumentation"],
            instruments: &["hand drums", "traditional strings", "flutes"],
            moods: &["vibrant", "spiritual", "celebratory"],
        },
        GenreFamily::Experimental => GenreProfile {
            traits: &["unconventional structure", "sound exploration", "texture-focused"],
            instruments: &["electronics", "found sounds", "prepared instruments"],
            moods: &["challenging", "mysterious", "abstract"],
        },
        GenreFamily::Generic => GenreProfile {
            traits: &["melodic", "rhythmic", "versatile"],
            instruments: &["vocals", "drums", "bass"],
            moods: &["expressive"],
        },
    }
}

/// Categories a meta tag can belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TagCategory {
    Structure,
    Vocal,
    Instrument,
    Mood,
    Genre,
    Tempo,
    Effect,
    Production,
    General,
}

impl TagCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            TagCategory::Structure => "structure",
            TagCategory::Vocal => "vocal",
            TagCategory::Instrument => "instrument",
            TagCategory::Mood => "mood",
            TagCategory::Genre => "genre",
            TagCategory::Tempo => "tempo",
            TagCategory::Effect => "effect",
            TagCategory::Production => "production",
            TagCategory::General => "general",
        }
    }
}

const TAG_MATCHERS: &[(TagCategory, &[&str])] = &[
    (
        TagCategory::Structure,
        &[
            "structure", "section", "verse", "chorus", "bridge", "intro", "outro", "hook",
            "pre-chorus", "breakdown", "drop", "interlude", "refrain", "ending",
        ],
    ),
    (
        TagCategory::Vocal,
        &[
            "vocal", "vocals", "voice", "singer", "singing", "harmony", "harmonies", "choir",
            "whisper", "falsetto", "duet", "spoken", "rap",
        ],
    ),
    (
        TagCategory::Instrument,
        &[
            "instrument", "instrumental", "guitar", "piano", "drums", "bass", "synth", "strings",
            "violin", "saxophone", "brass", "solo",
        ],
    ),
    (
        TagCategory::Mood,
        &[
            "mood", "emotion", "emotional", "feel", "atmosphere", "dark", "happy", "sad",
            "energetic", "melancholic", "uplifting", "calm",
        ],
    ),
    (TagCategory::Genre, &["genre", "style", "styles"]),
    (TagCategory::Tempo, &["tempo", "bpm", "pace", "speed", "rhythm", "dynamics"]),
    (
        TagCategory::Effect,
        &["effect", "effects", "fx", "echo", "distortion", "reverb", "applause", "silence"],
    ),
    (
        TagCategory::Production,
        &["production", "mix", "mixing", "mastering", "lo-fi", "quality", "recording"],
    ),
];

/// Kinds of technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TechniqueKind {
    Prompting,
    Structure,
    Lyrics,
    Vocal,
    Production,
    General,
}

impl TechniqueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TechniqueKind::Prompting => "prompting",
            TechniqueKind::Structure => "structure",
            TechniqueKind::Lyrics => "lyrics",
            TechniqueKind::Vocal => "vocal",
            TechniqueKind::Production => "production",
            TechniqueKind::General => "general",
        }
    }
}

const TECHNIQUE_MATCHERS: &[(TechniqueKind, &[&str])] = &[
    (
        TechniqueKind::Lyrics,
        &["lyric", "lyrics", "rhyme", "rhymes", "syllable", "syllables", "wordplay"],
    ),
    (
        TechniqueKind::Prompting,
        &["prompt", "prompts", "prompting", "keyword", "keywords", "description", "wording"],
    ),
    (
        TechniqueKind::Structure,
        &["structure", "arrangement", "section", "sections", "song form", "meta tags"],
    ),
    (
        TechniqueKind::Vocal,
        &["vocal", "vocals", "voice", "singing", "singer", "harmony"],
    ),
    (
        TechniqueKind::Production,
        &["production", "mix", "mixing", "mastering", "sound design", "effects", "stems"],
    ),
];

/// Lowercased words of `text` plus the normalized text for phrase lookups.
pub struct Keywords {
    words: Vec<String>,
    normalized: String,
}

impl Keywords {
    pub fn new(text: &str) -> Self {
        let lower = text.to_lowercase();
        let words: Vec<String> = lower.unicode_words().map(str::to_string).collect();
        let normalized = format!(" {} ", words.join(" "));
        Self { words, normalized }
    }

    /// Single words match whole tokens; phrases match on token boundaries.
    pub fn contains(&self, keyword: &str) -> bool {
        let needle = Keywords::new(keyword);
        match needle.words.len() {
            0 => false,
            1 => self.words.iter().any(|w| *w == needle.words[0]),
            _ => self.normalized.contains(&needle.normalized),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }
}

fn first_match<T: Copy>(matchers: &[(T, &[&str])], text: &str) -> Option<T> {
    let keywords = Keywords::new(text);
    if keywords.is_empty() {
        return None;
    }
    matchers
        .iter()
        .find(|(_, words)| words.iter().any(|w| keywords.contains(w)))
        .map(|(tag, _)| *tag)
}

fn all_matches<T: Copy + PartialEq>(matchers: &[(T, &[&str])], text: &str) -> Vec<T> {
    let keywords = Keywords::new(text);
    matchers
        .iter()
        .filter(|(_, words)| words.iter().any(|w| keywords.contains(w)))
        .map(|(tag, _)| *tag)
        .collect()
}

/// Genre family named by `text`, if any.
pub fn classify_genre(text: &str) -> Option<GenreFamily> {
    first_match(GENRE_MATCHERS, text)
}

/// Tag category named by `text`, if any.
pub fn classify_tag(text: &str) -> Option<TagCategory> {
    first_match(TAG_MATCHERS, text)
}

/// Every tag category whose keywords occur in `text`.
pub fn tag_categories_in(text: &str) -> Vec<TagCategory> {
    all_matches(TAG_MATCHERS, text)
}

/// Technique kind named by `text`, if any.
pub fn classify_technique(text: &str) -> Option<TechniqueKind> {
    first_match(TECHNIQUE_MATCHERS, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_electronic_heading_maps_to_electronic_profile() {
        assert_eq!(classify_genre("Electronic"), Some(GenreFamily::Electronic));
        let profile = genre_profile(GenreFamily::Electronic);
        assert!(profile.traits.contains(&"synthesized"));
        assert!(profile.traits.contains(&"digital production"));
    }

    #[test]
    fn test_metal_wins_over_rock() {
        assert_eq!(classify_genre("Black metal rock"), Some(GenreFamily::Metal));
    }

    #[test]
    fn test_whole_word_matching() {
        // "rap" must not match inside "therapy" or "trap door"
        assert_eq!(classify_genre("Music therapy"), None);
        assert_eq!(classify_genre("Hip hop and rap"), Some(GenreFamily::HipHop));
        assert!(Keywords::new("Drum and bass music").contains("drum and bass"));
        assert!(!Keywords::new("Drum kits and bass").contains("drum and bass"));
    }

    #[test]
    fn test_unknown_text_has_no_family() {
        assert_eq!(classify_genre("Miscellaneous"), None);
        assert_eq!(classify_genre(""), None);
        assert!(!genre_profile(GenreFamily::Generic).traits.is_empty());
    }

    #[test]
    fn test_tag_categories() {
        assert_eq!(classify_tag("Song Structure Tags"), Some(TagCategory::Structure));
        assert_eq!(classify_tag("Vocal Styles"), Some(TagCategory::Vocal));
        assert_eq!(classify_tag("Other"), None);

        let found = tag_categories_in("Chorus with layered vocals and piano");
        assert_eq!(
            found,
            vec![TagCategory::Structure, TagCategory::Vocal, TagCategory::Instrument]
        );
    }

    #[test]
    fn test_technique_kinds() {
        assert_eq!(classify_technique("Writing better lyrics"), Some(TechniqueKind::Lyrics));
        assert_eq!(classify_technique("Prompt engineering"), Some(TechniqueKind::Prompting));
        assert_eq!(classify_technique("Miscellaneous"), None);
    }
}

// src/services/fallback.rs

//! Built-in reference records served when neither a live page nor a cached
//! document can be parsed.

use crate::models::{
    DomainRecord, GenreRecord, MetaTagRecord, RecordKind, RecordMeta, TechniqueRecord,
};
use crate::services::vocabulary::{self, GenreFamily};

/// Source URL stamped on every built-in record.
pub const FALLBACK_SOURCE: &str = "builtin:fallback";

const FALLBACK_CONFIDENCE: f64 = 0.3;

const GENRES: &[(&str, &str, GenreFamily, &[&str])] = &[
    (
        "Pop",
        "Mainstream music built around catchy melodies and hooks",
        GenreFamily::Pop,
        &["Synth-pop", "Dance-pop", "Indie pop"],
    ),
    (
        "Rock",
        "Guitar-driven music with a strong backbeat",
        GenreFamily::Rock,
        &["Alternative rock", "Punk rock", "Indie rock"],
    ),
    (
        "Electronic",
        "Music produced primarily with synthesizers and drum machines",
        GenreFamily::Electronic,
        &["House", "Techno", "Ambient", "Drum and bass"],
    ),
    (
        "Hip hop",
        "Rhythmic vocals over sampled or programmed beats",
        GenreFamily::HipHop,
        &["Trap", "Boom bap", "Lo-fi hip hop"],
    ),
    (
        "Jazz",
        "Improvisation over swing rhythms and extended harmony",
        GenreFamily::Jazz,
        &["Bebop", "Smooth jazz", "Jazz fusion"],
    ),
    (
        "Classical",
        "Composed orchestral and chamber music",
        GenreFamily::Classical,
        &["Baroque", "Romantic", "Minimalism"],
    ),
    (
        "Folk",
        "Acoustic, song-centred music rooted in tradition",
        GenreFamily::Folk,
        &["Indie folk", "Celtic folk"],
    ),
    (
        "R&B",
        "Groove-based music with soulful vocals",
        GenreFamily::RnB,
        &["Neo soul", "Funk"],
    ),
];

const META_TAGS: &[(&str, &str, &str)] = &[
    ("Intro", "structure", "Opening section that sets the mood"),
    ("Verse", "structure", "Main storytelling section of the song"),
    ("Pre-Chorus", "structure", "Build-up leading into the chorus"),
    ("Chorus", "structure", "Repeated hook and emotional peak"),
    ("Bridge", "structure", "Contrasting section before the final chorus"),
    ("Outro", "structure", "Closing section"),
    ("Instrumental", "instrument", "Section without vocals"),
    ("Guitar Solo", "instrument", "Featured lead guitar passage"),
    ("Female Vocals", "vocal", "Sung by a female lead voice"),
    ("Male Vocals", "vocal", "Sung by a male lead voice"),
];

const TECHNIQUES: &[(&str, &str, &str, &[&str], &[&str])] = &[
    (
        "Be specific about style",
        "Name the genre, era, instruments and mood instead of generic adjectives",
        "prompting",
        &["melancholic 80s synthwave with gated drums"],
        &["When results sound generic"],
    ),
    (
        "Mark song sections",
        "Put structure tags such as [Verse] and [Chorus] on their own lines",
        "structure",
        &["[Verse]", "[Chorus]", "[Bridge]"],
        &["When the arrangement comes out in the wrong order"],
    ),
    (
        "Keep lines singable",
        "Use short lines with a consistent syllable count and clear rhymes",
        "lyrics",
        &["Eight syllables per line in the verse"],
        &["When vocals sound rushed"],
    ),
];

/// Built-in records of `kind`. Never empty.
pub fn records(kind: RecordKind) -> Vec<DomainRecord> {
    match kind {
        RecordKind::Genre => GENRES
            .iter()
            .map(|(name, description, family, subgenres)| {
                let profile = vocabulary::genre_profile(*family);
                DomainRecord::Genre(GenreRecord {
                    name: name.to_string(),
                    description: description.to_string(),
                    subgenres: to_strings(subgenres),
                    traits: to_strings(profile.traits),
                    instruments: to_strings(profile.instruments),
                    moods: to_strings(profile.moods),
                    meta: meta(),
                })
            })
            .collect(),
        RecordKind::MetaTag => META_TAGS
            .iter()
            .map(|(tag, category, description)| {
                DomainRecord::MetaTag(MetaTagRecord {
                    tag: tag.to_string(),
                    category: category.to_string(),
                    description: description.to_string(),
                    examples: vec![format!("[{tag}]")],
                    compatible_categories: Vec::new(),
                    meta: meta(),
                })
            })
            .collect(),
        RecordKind::Technique => TECHNIQUES
            .iter()
            .map(|(name, description, kind, examples, scenarios)| {
                DomainRecord::Technique(TechniqueRecord {
                    name: name.to_string(),
                    description: description.to_string(),
                    technique_kind: kind.to_string(),
                    examples: to_strings(examples),
                    scenarios: to_strings(scenarios),
                    meta: meta(),
                })
            })
            .collect(),
    }
}

fn meta() -> RecordMeta {
    RecordMeta::new(FALLBACK_SOURCE, FALLBACK_CONFIDENCE)
}

fn to_strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_kind_has_records() {
        for kind in RecordKind::ALL {
            let records = records(kind);
            assert!(!records.is_empty(), "{kind} catalogue is empty");
            assert!(records.iter().all(|r| r.kind() == kind));
            assert!(records.iter().all(|r| r.meta().source_url == FALLBACK_SOURCE));
            assert!(records.iter().all(|r| r.meta().confidence < 0.5));
        }
    }

    #[test]
    fn test_genres_carry_profiles() {
        let records = records(RecordKind::Genre);
        let electronic = records
            .iter()
            .filter_map(DomainRecord::as_genre)
            .find(|g| g.name == "Electronic")
            .unwrap();
        assert!(electronic.traits.iter().any(|t| t == "synthesized"));
        assert!(electronic.subgenres.iter().any(|s| s == "Ambient"));
    }
}

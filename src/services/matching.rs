//! Track identity and fuzzy matching across platforms.
//!
//! Given a library track and a platform candidate, produces a confidence in
//! [0, 1] and a decision: auto-link, candidate needing confirmation, or no
//! match. A strong shared identifier (ISRC) short-circuits to confidence 1.

use levenshtein::levenshtein;
use regex::Regex;
use unicode_normalization::UnicodeNormalization;

use crate::config::SyncConfig;
use crate::models::{ExtTrack, Track};

const TITLE_WEIGHT: f64 = 0.45;
const ARTIST_WEIGHT: f64 = 0.30;
const ALBUM_WEIGHT: f64 = 0.15;
const DURATION_WEIGHT: f64 = 0.10;

/// Duration agreement window for the duration component of the score.
const DURATION_TOLERANCE_MS: i64 = 3_000;

/// Tokens closer than this (normalized levenshtein) count as equal.
const TOKEN_SIMILARITY_FLOOR: f64 = 0.8;

/// Guard against float rounding when comparing against the thresholds, so a
/// score that is mathematically exactly at a threshold lands on the
/// inclusive side.
const THRESHOLD_EPSILON: f64 = 1e-9;

/// What the matcher concluded about a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchDecision {
    /// Confident enough to link without asking.
    Auto,
    /// Plausible, surfaced to the user for confirmation.
    Candidate,
    /// Discarded.
    NoMatch,
}

#[derive(Debug, Clone, Copy)]
pub struct MatchOutcome {
    pub confidence: f64,
    pub decision: MatchDecision,
}

impl MatchOutcome {
    pub fn is_match(&self) -> bool {
        self.decision == MatchDecision::Auto
    }
}

/// The local side of a comparison. Built from a [`Track`] plus whatever
/// strong identifiers its platform links carry.
#[derive(Debug, Clone, Default)]
pub struct LocalTrackFacts {
    pub title: String,
    pub artist: String,
    pub album: Option<String>,
    pub duration_ms: Option<i64>,
    pub isrc: Option<String>,
    /// Release+position reference from a catalog-platform link.
    pub release_ref: Option<String>,
    /// Exact file hash recorded at import for local files.
    pub content_hash: Option<String>,
}

impl From<&Track> for LocalTrackFacts {
    fn from(track: &Track) -> Self {
        Self {
            title: track.title.clone(),
            artist: track.primary_artist.clone(),
            album: track.album.clone(),
            duration_ms: track.duration_ms,
            isrc: None,
            release_ref: None,
            content_hash: track.content_hash.clone(),
        }
    }
}

/// Fuzzy matching between library tracks and platform candidates
pub struct TrackMatcher {
    auto_threshold: f64,
    candidate_threshold: f64,
    featuring_patterns: Vec<Regex>,
    remaster_pattern: Regex,
    year_suffix_pattern: Regex,
}

impl TrackMatcher {
    pub fn new(config: &SyncConfig) -> Self {
        Self::with_thresholds(config.match_auto_threshold, config.match_candidate_threshold)
    }

    pub fn with_thresholds(auto_threshold: f64, candidate_threshold: f64) -> Self {
        // Compile the title-noise patterns once; matching runs per track
        // pair on the sync hot path.
        let featuring_patterns = vec![
            Regex::new(r"(?i)\s*[(\[][^)\]]*\b(?:feat\.?|ft\.?|featuring|with)\b[^)\]]*[)\]]")
                .unwrap(),
            Regex::new(r"(?i)\s+(?:feat\.?|ft\.?|featuring)\s+.+$").unwrap(),
        ];
        let remaster_pattern = Regex::new(
            r"(?i)\s*[-(\[]?\s*(?:\d{4}\s+)?remaster(?:ed)?(?:\s+\d{4})?(?:\s+version)?\s*[)\]]?\s*$",
        )
        .unwrap();
        let year_suffix_pattern = Regex::new(r"\s*[(\[]\d{4}[)\]]\s*$").unwrap();

        Self {
            auto_threshold,
            candidate_threshold,
            featuring_patterns,
            remaster_pattern,
            year_suffix_pattern,
        }
    }

    /// Normalize a metadata string for comparison: NFC, lowercase, featured
    /// artist and remaster annotations stripped, whitespace collapsed.
    pub fn normalize(&self, raw: &str) -> String {
        let mut s: String = raw.trim().nfc().collect::<String>().to_lowercase();
        for pattern in &self.featuring_patterns {
            s = pattern.replace_all(&s, "").into_owned();
        }
        s = self.remaster_pattern.replace(&s, "").into_owned();
        s = self.year_suffix_pattern.replace(&s, "").into_owned();
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Score one local/remote pair.
    pub fn score(&self, local: &LocalTrackFacts, remote: &ExtTrack) -> MatchOutcome {
        let title_a = self.normalize(&local.title);
        let title_b = self.normalize(&remote.title);
        let artist_a = self.normalize(&local.artist);
        let artist_b = self.normalize(&remote.artist);

        if title_a.is_empty() || title_b.is_empty() || artist_a.is_empty() || artist_b.is_empty() {
            return MatchOutcome {
                confidence: 0.0,
                decision: MatchDecision::NoMatch,
            };
        }

        // A shared strong identifier settles identity outright.
        if has_strong_id_agreement(local, remote) {
            return MatchOutcome {
                confidence: 1.0,
                decision: MatchDecision::Auto,
            };
        }

        let mut confidence = TITLE_WEIGHT * token_set_similarity(&title_a, &title_b)
            + ARTIST_WEIGHT * token_set_similarity(&artist_a, &artist_b);

        if let (Some(album_a), Some(album_b)) = (local.album.as_deref(), remote.album.as_deref()) {
            let album_a = self.normalize(album_a);
            let album_b = self.normalize(album_b);
            if !album_a.is_empty() && !album_b.is_empty() {
                confidence += ALBUM_WEIGHT * token_set_similarity(&album_a, &album_b);
            }
        }

        if let (Some(d_a), Some(d_b)) = (local.duration_ms, remote.duration_ms) {
            if (d_a - d_b).abs() <= DURATION_TOLERANCE_MS {
                confidence += DURATION_WEIGHT;
            }
        }

        MatchOutcome {
            confidence,
            decision: self.decide(confidence),
        }
    }

    /// Score every candidate and return the best one, with deterministic
    /// tie-breakers: shared album first, then smallest duration delta, then
    /// lowest external id.
    pub fn best_match<'a>(
        &self,
        local: &LocalTrackFacts,
        candidates: &'a [ExtTrack],
    ) -> Option<(&'a ExtTrack, MatchOutcome)> {
        let mut scored: Vec<(&ExtTrack, MatchOutcome)> = candidates
            .iter()
            .map(|candidate| (candidate, self.score(local, candidate)))
            .filter(|(_, outcome)| outcome.decision != MatchDecision::NoMatch)
            .collect();

        let local_album = local.album.as_deref().map(|a| self.normalize(a));
        scored.sort_by(|(a, oa), (b, ob)| {
            ob.confidence
                .partial_cmp(&oa.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let shares = |t: &ExtTrack| {
                        matches!((&local_album, t.album.as_deref()),
                            (Some(la), Some(ta)) if !la.is_empty() && *la == self.normalize(ta))
                    };
                    shares(b).cmp(&shares(a))
                })
                .then_with(|| {
                    let delta = |t: &ExtTrack| match (local.duration_ms, t.duration_ms) {
                        (Some(l), Some(r)) => (l - r).abs(),
                        _ => i64::MAX,
                    };
                    delta(a).cmp(&delta(b))
                })
                .then_with(|| a.external_id.cmp(&b.external_id))
        });

        scored.into_iter().next()
    }

    fn decide(&self, confidence: f64) -> MatchDecision {
        if confidence >= self.auto_threshold - THRESHOLD_EPSILON {
            MatchDecision::Auto
        } else if confidence >= self.candidate_threshold - THRESHOLD_EPSILON {
            MatchDecision::Candidate
        } else {
            MatchDecision::NoMatch
        }
    }
}

/// Strong identifiers that settle identity on their own: a shared ISRC, a
/// shared release+position reference, or an identical file hash.
fn has_strong_id_agreement(local: &LocalTrackFacts, remote: &ExtTrack) -> bool {
    let pairs = [
        (local.isrc.as_deref(), remote.isrc.as_deref()),
        (local.release_ref.as_deref(), remote.release_ref.as_deref()),
        (local.content_hash.as_deref(), remote.content_hash.as_deref()),
    ];
    pairs.iter().any(|(a, b)| match (a, b) {
        (Some(a), Some(b)) => !a.is_empty() && a.eq_ignore_ascii_case(b),
        _ => false,
    })
}

/// Similarity of two normalized strings as token sets: greedy pairing where
/// exact tokens count 1.0 and near tokens (levenshtein) count their
/// similarity, scaled by the combined token count.
fn token_set_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let tokens_a: Vec<&str> = a.split_whitespace().collect();
    let mut tokens_b: Vec<&str> = b.split_whitespace().collect();
    if tokens_a.is_empty() || tokens_b.is_empty() {
        return 0.0;
    }

    let total = (tokens_a.len() + tokens_b.len()) as f64;
    let mut matched = 0.0;

    for token in &tokens_a {
        let mut best: Option<(usize, f64)> = None;
        for (i, other) in tokens_b.iter().enumerate() {
            let similarity = token_similarity(token, other);
            if similarity >= TOKEN_SIMILARITY_FLOOR
                && best.map(|(_, s)| similarity > s).unwrap_or(true)
            {
                best = Some((i, similarity));
            }
        }
        if let Some((i, similarity)) = best {
            matched += similarity;
            tokens_b.remove(i);
        }
    }

    (2.0 * matched / total).clamp(0.0, 1.0)
}

fn token_similarity(a: &str, b: &str) -> f64 {
    if a == b {
        return 1.0;
    }
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 0.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher() -> TrackMatcher {
        TrackMatcher::new(&SyncConfig::default())
    }

    fn facts(title: &str, artist: &str) -> LocalTrackFacts {
        LocalTrackFacts {
            title: title.to_string(),
            artist: artist.to_string(),
            ..Default::default()
        }
    }

    #[rstest::rstest]
    #[case("One More Time (feat. Romanthony)", "one more time")]
    #[case("Gold ft. Foxes", "gold")]
    #[case("Blue Monday - 2016 Remaster", "blue monday")]
    #[case("Heroes (2017 Remastered Version)", "heroes")]
    #[case("  Strobe   [1999] ", "strobe")]
    #[case("Around the\u{0041}\u{030A} World", "around theå world")]
    fn normalization_strips_noise(#[case] input: &str, #[case] expected: &str) {
        assert_eq!(matcher().normalize(input), expected);
    }

    #[test]
    fn isrc_agreement_is_definitive() {
        let m = matcher();
        let mut local = facts("Completely Different Title", "Somebody");
        local.isrc = Some("GBARL9300135".to_string());
        let remote = ExtTrack::new("yt:1", "Other Name", "Other Artist").with_isrc("gbarl9300135");

        let outcome = m.score(&local, &remote);
        assert_eq!(outcome.confidence, 1.0);
        assert!(outcome.is_match());
    }

    #[test]
    fn release_reference_agreement_is_definitive() {
        let m = matcher();
        let mut local = facts("Phylyps Trak", "Basic Channel");
        local.release_ref = Some("1176328#A2".to_string());
        let remote =
            ExtTrack::new("dg:7", "Phylyps Trak (untitled)", "BC").with_release_ref("1176328#A2");

        let outcome = m.score(&local, &remote);
        assert_eq!(outcome.confidence, 1.0);
        assert!(outcome.is_match());
    }

    #[test]
    fn identical_file_hash_is_definitive() {
        let m = matcher();
        let mut local = facts("Untitled 03", "Unknown");
        local.content_hash = Some("9f2c4a11d6".to_string());
        let remote = ExtTrack::new("rb:3", "03 untitled", "unknown artist")
            .with_content_hash("9F2C4A11D6");

        let outcome = m.score(&local, &remote);
        assert_eq!(outcome.confidence, 1.0);
        assert!(outcome.is_match());

        // A differing hash falls back to metadata scoring.
        let other = ExtTrack::new("rb:4", "03 untitled", "unknown artist")
            .with_content_hash("0000000000");
        assert!(m.score(&local, &other).confidence < 1.0);
    }

    #[test]
    fn empty_title_or_artist_scores_zero() {
        let m = matcher();
        let remote = ExtTrack::new("sp:1", "Xtal", "Aphex Twin");
        assert_eq!(m.score(&facts("", "Aphex Twin"), &remote).confidence, 0.0);
        assert_eq!(m.score(&facts("Xtal", "   "), &remote).confidence, 0.0);

        let blank_remote = ExtTrack::new("sp:2", "Xtal", "");
        assert_eq!(
            m.score(&facts("Xtal", "Aphex Twin"), &blank_remote).confidence,
            0.0
        );
    }

    #[test]
    fn full_metadata_agreement_auto_links() {
        let m = matcher();
        let mut local = facts("Windowlicker", "Aphex Twin");
        local.album = Some("Windowlicker".to_string());
        local.duration_ms = Some(366_000);
        let remote = ExtTrack::new("sp:9", "Windowlicker", "Aphex Twin")
            .with_album("Windowlicker")
            .with_duration_ms(364_500);

        let outcome = m.score(&local, &remote);
        assert!(outcome.confidence > 0.99);
        assert_eq!(outcome.decision, MatchDecision::Auto);
    }

    #[test]
    fn title_and_artist_only_is_a_candidate() {
        // Without album or duration evidence, the maximum reachable score is
        // 0.75, below the auto threshold but inside the candidate band.
        let m = matcher();
        let outcome = m.score(
            &facts("Teardrop", "Massive Attack"),
            &ExtTrack::new("dg:1", "Teardrop", "Massive Attack"),
        );
        assert!((outcome.confidence - 0.75).abs() < 1e-9);
        assert_eq!(outcome.decision, MatchDecision::Candidate);
    }

    #[test]
    fn boundary_scores_land_on_the_inclusive_side() {
        // Thresholds arranged so exact component sums hit them: title+artist
        // = 0.75 exactly at candidate; +duration = 0.85 exactly at auto.
        let m = TrackMatcher::with_thresholds(0.85, 0.75);

        let exact_candidate = m.score(
            &facts("Angel", "Massive Attack"),
            &ExtTrack::new("x:1", "Angel", "Massive Attack"),
        );
        assert_eq!(exact_candidate.decision, MatchDecision::Candidate);

        let mut local = facts("Angel", "Massive Attack");
        local.duration_ms = Some(379_000);
        let exact_auto = m.score(
            &local,
            &ExtTrack::new("x:2", "Angel", "Massive Attack").with_duration_ms(380_000),
        );
        assert_eq!(exact_auto.decision, MatchDecision::Auto);

        // Just below the candidate threshold drops out entirely.
        let below = m.score(
            &facts("Angel", "Massive Attack"),
            &ExtTrack::new("x:3", "Angel", "Portishead"),
        );
        assert_eq!(below.decision, MatchDecision::NoMatch);
    }

    #[test]
    fn duration_outside_tolerance_contributes_nothing() {
        let m = matcher();
        let mut local = facts("Flim", "Aphex Twin");
        local.duration_ms = Some(177_000);

        let near = m.score(
            &local,
            &ExtTrack::new("a", "Flim", "Aphex Twin").with_duration_ms(179_900),
        );
        let far = m.score(
            &local,
            &ExtTrack::new("b", "Flim", "Aphex Twin").with_duration_ms(190_000),
        );
        assert!(near.confidence > far.confidence);
        assert!((near.confidence - far.confidence - DURATION_WEIGHT).abs() < 1e-9);
    }

    #[test]
    fn best_match_prefers_shared_album_then_duration_then_id() {
        let m = matcher();
        let mut local = facts("Avril 14th", "Aphex Twin");
        local.album = Some("Drukqs".to_string());
        local.duration_ms = Some(125_000);

        let candidates = vec![
            ExtTrack::new("z-single", "Avril 14th", "Aphex Twin")
                .with_album("Avril 14th - Single")
                .with_duration_ms(125_000),
            ExtTrack::new("m-album", "Avril 14th", "Aphex Twin")
                .with_album("Drukqs")
                .with_duration_ms(125_000),
        ];
        let (best, _) = m.best_match(&local, &candidates).unwrap();
        assert_eq!(best.external_id, "m-album");

        // Identical metadata: lowest external id wins deterministically.
        let twins = vec![
            ExtTrack::new("b", "Avril 14th", "Aphex Twin").with_duration_ms(125_000),
            ExtTrack::new("a", "Avril 14th", "Aphex Twin").with_duration_ms(125_000),
        ];
        let (best, _) = m.best_match(&local, &twins).unwrap();
        assert_eq!(best.external_id, "a");
    }

    #[test]
    fn token_set_similarity_tolerates_reordering_and_typos() {
        assert_eq!(token_set_similarity("daft punk", "punk daft"), 1.0);
        assert!(token_set_similarity("around the world", "arond the world") > 0.9);
        assert_eq!(token_set_similarity("blue monday", "paranoid android"), 0.0);
    }

    proptest::proptest! {
        #[test]
        fn confidence_stays_within_unit_interval(
            title in ".{0,40}",
            artist in ".{0,40}",
            remote_title in ".{0,40}",
            remote_artist in ".{0,40}",
        ) {
            let m = TrackMatcher::with_thresholds(0.82, 0.60);
            let local = LocalTrackFacts {
                title,
                artist,
                ..Default::default()
            };
            let remote = ExtTrack::new("x:1", remote_title, remote_artist);
            let outcome = m.score(&local, &remote);
            proptest::prop_assert!((0.0..=1.0).contains(&outcome.confidence));
        }
    }
}

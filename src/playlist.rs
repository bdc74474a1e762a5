// Playlist model and M3U8 parser.
//
// The parser walks a media playlist line by line, maintaining the current
// encryption context and the pending EXTINF state, and yields an immutable
// ordered segment list. Master playlists are resolved through a caller
// supplied variant selector.

use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};
use url::Url;

use crate::error::DownloadError;
use crate::fetch::{Fetcher, read_to_end};

/// How a run of segments is encrypted. AES-128-CBC is the only supported
/// method; `METHOD=NONE` clears the context instead of producing a spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncryptionMethod {
    Aes128,
}

/// Encryption context shared by a contiguous run of segments.
///
/// Identity is `(method, key_uri, iv)`; the key cell never participates in
/// equality. The cell is populated at most once, by the orchestrator, before
/// any worker that reads it is dispatched.
#[derive(Debug)]
pub struct EncryptionSpec {
    pub method: EncryptionMethod,
    pub key_uri: Url,
    pub iv: Option<[u8; 16]>,
    key: OnceLock<[u8; 16]>,
}

impl EncryptionSpec {
    pub fn new(method: EncryptionMethod, key_uri: Url, iv: Option<[u8; 16]>) -> Self {
        Self {
            method,
            key_uri,
            iv,
            key: OnceLock::new(),
        }
    }

    /// The cached key bytes, if already fetched.
    pub fn key(&self) -> Option<[u8; 16]> {
        self.key.get().copied()
    }

    /// Populate the key cell. Returns false if it was already populated.
    pub fn set_key(&self, key: [u8; 16]) -> bool {
        self.key.set(key).is_ok()
    }
}

impl PartialEq for EncryptionSpec {
    fn eq(&self, other: &Self) -> bool {
        self.method == other.method && self.key_uri == other.key_uri && self.iv == other.iv
    }
}

impl Eq for EncryptionSpec {}

/// One media segment of a playlist. Immutable after parse.
#[derive(Debug, Clone)]
pub struct Segment {
    pub index: u64,
    pub uri: Url,
    pub duration: f64,
    pub title: Option<String>,
    pub encryption: Option<Arc<EncryptionSpec>>,
}

/// A parsed media playlist: the ordered segment list plus the metadata the
/// processor needs.
#[derive(Debug, Clone)]
pub struct Playlist {
    pub segments: Vec<Segment>,
    pub target_duration: u64,
    pub media_sequence: u64,
    pub end_list: bool,
}

impl Playlist {
    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// The media-sequence-adjusted index of a segment, used as the default
    /// AES-128-CBC IV when the key tag carries none.
    pub fn iv_index(&self, segment: &Segment) -> u64 {
        self.media_sequence + segment.index
    }

    /// The distinct encryption specs of this playlist, by structural
    /// equality. Adjacent segments under one `#EXT-X-KEY` already share a
    /// spec, so this is O(unique specs) for well-formed playlists.
    pub fn unique_encryption_specs(&self) -> Vec<Arc<EncryptionSpec>> {
        let mut unique: Vec<Arc<EncryptionSpec>> = Vec::new();
        for segment in &self.segments {
            if let Some(spec) = &segment.encryption
                && !unique.iter().any(|s| s.as_ref() == spec.as_ref())
            {
                unique.push(Arc::clone(spec));
            }
        }
        unique
    }
}

/// One entry of a master playlist.
#[derive(Debug, Clone)]
pub struct VariantStream {
    pub uri: Url,
    pub bandwidth: u64,
    pub resolution: Option<(u64, u64)>,
    pub codecs: Option<String>,
}

/// Picks the variant to follow when the entry URL is a master playlist.
pub trait VariantSelector: Send + Sync {
    fn select<'a>(&self, variants: &'a [VariantStream]) -> Result<&'a VariantStream, DownloadError>;
}

/// Built-in selection policies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum VariantSelectionPolicy {
    #[default]
    HighestBandwidth,
    LowestBandwidth,
    First,
}

impl VariantSelector for VariantSelectionPolicy {
    fn select<'a>(&self, variants: &'a [VariantStream]) -> Result<&'a VariantStream, DownloadError> {
        let chosen = match self {
            Self::HighestBandwidth => variants.iter().max_by_key(|v| v.bandwidth),
            Self::LowestBandwidth => variants.iter().min_by_key(|v| v.bandwidth),
            Self::First => variants.first(),
        };
        chosen.ok_or_else(|| DownloadError::invalid_playlist("master playlist has no variants"))
    }
}

/// Outcome of parsing one playlist document.
#[derive(Debug)]
pub enum ParsedPlaylist {
    Media(Playlist),
    Master(Vec<VariantStream>),
}

/// Fetch the playlist at `url`, resolving master playlists through
/// `selector` until a media playlist is reached.
pub async fn load_playlist(
    fetcher: &dyn Fetcher,
    url: &Url,
    strict: bool,
    selector: &dyn VariantSelector,
) -> Result<Playlist, DownloadError> {
    // A master playlist whose variants are themselves masters is pathological
    // but representable; bound the recursion.
    const MAX_VARIANT_DEPTH: usize = 4;

    let mut current = url.clone();
    for _ in 0..MAX_VARIANT_DEPTH {
        let body = read_to_end(fetcher.fetch(&current).await?).await?;
        let text = std::str::from_utf8(&body).map_err(|e| {
            DownloadError::invalid_playlist(format!("playlist at {current} is not UTF-8: {e}"))
        })?;
        match parse_playlist(text, &current, strict)? {
            ParsedPlaylist::Media(playlist) => return Ok(playlist),
            ParsedPlaylist::Master(variants) => {
                let chosen = selector.select(&variants)?;
                debug!(uri = %chosen.uri, bandwidth = chosen.bandwidth, "Selected variant stream");
                current = chosen.uri.clone();
            }
        }
    }
    Err(DownloadError::invalid_playlist(
        "variant playlists nested too deeply",
    ))
}

/// Parse one playlist document. `base` is the URL the document was fetched
/// from; relative references are resolved against it.
pub fn parse_playlist(
    text: &str,
    base: &Url,
    strict: bool,
) -> Result<ParsedPlaylist, DownloadError> {
    let first_content = text
        .lines()
        .map(|l| l.trim_end_matches('\r').trim())
        .find(|l| !l.is_empty());
    match first_content {
        Some(line) if line.starts_with("#EXTM3U") => {}
        _ => {
            return Err(DownloadError::invalid_playlist(
                "document does not start with #EXTM3U",
            ));
        }
    }

    if text.contains("#EXT-X-STREAM-INF") {
        parse_master(text, base).map(ParsedPlaylist::Master)
    } else {
        parse_media(text, base, strict).map(ParsedPlaylist::Media)
    }
}

fn parse_master(text: &str, base: &Url) -> Result<Vec<VariantStream>, DownloadError> {
    let mut variants = Vec::new();
    let mut pending_attrs: Option<Vec<(String, String)>> = None;

    for raw in text.lines() {
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix("#EXT-X-STREAM-INF:") {
            pending_attrs = Some(parse_attributes(rest));
            continue;
        }
        if line.starts_with('#') {
            continue;
        }
        let Some(attrs) = pending_attrs.take() else {
            continue;
        };
        let uri = base.join(line).map_err(|e| {
            DownloadError::invalid_playlist(format!("cannot resolve variant URI `{line}`: {e}"))
        })?;
        let bandwidth = attr_value(&attrs, "BANDWIDTH")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);
        let resolution = attr_value(&attrs, "RESOLUTION").and_then(|v| {
            let (w, h) = v.split_once('x')?;
            Some((w.parse::<u64>().ok()?, h.parse::<u64>().ok()?))
        });
        let codecs = attr_value(&attrs, "CODECS").map(str::to_string);
        variants.push(VariantStream {
            uri,
            bandwidth,
            resolution,
            codecs,
        });
    }

    if variants.is_empty() {
        return Err(DownloadError::invalid_playlist(
            "master playlist has no variants",
        ));
    }
    Ok(variants)
}

fn parse_media(text: &str, base: &Url, strict: bool) -> Result<Playlist, DownloadError> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut current_key: Option<Arc<EncryptionSpec>> = None;
    let mut pending: Option<(f64, Option<String>)> = None;
    let mut target_duration: u64 = 0;
    let mut media_sequence: u64 = 0;
    let mut end_list = false;

    for (line_no, raw) in text.lines().enumerate() {
        let line_no = line_no + 1;
        let line = raw.trim_end_matches('\r').trim();
        if line.is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix("#EXTINF:") {
            pending = Some(parse_extinf(rest, line_no)?);
        } else if let Some(rest) = line.strip_prefix("#EXT-X-TARGETDURATION:") {
            target_duration = rest.trim().parse::<u64>().map_err(|e| {
                DownloadError::invalid_playlist(format!(
                    "bad target duration `{rest}` on line {line_no}: {e}"
                ))
            })?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-MEDIA-SEQUENCE:") {
            media_sequence = rest.trim().parse::<u64>().map_err(|e| {
                DownloadError::invalid_playlist(format!(
                    "bad media sequence `{rest}` on line {line_no}: {e}"
                ))
            })?;
        } else if let Some(rest) = line.strip_prefix("#EXT-X-KEY:") {
            // Two key tags without a segment between them: the later wins.
            current_key = parse_key(rest, base, line_no)?.map(Arc::new);
        } else if line.starts_with("#EXT-X-ENDLIST") {
            end_list = true;
        } else if line.starts_with("#EXTM3U")
            || line.starts_with("#EXT-X-VERSION")
            || line.starts_with("#EXT-X-PLAYLIST-TYPE")
        {
            // Recognized structural tags with no effect on the segment walk.
        } else if line.starts_with("#EXT") {
            if strict {
                let tag = line.split(':').next().unwrap_or(line).to_string();
                return Err(DownloadError::UnsupportedTag { tag, line: line_no });
            }
        } else if line.starts_with('#') {
            // Comment.
        } else {
            let uri = base.join(line).map_err(|e| {
                DownloadError::invalid_playlist(format!(
                    "cannot resolve segment URI `{line}` on line {line_no}: {e}"
                ))
            })?;
            let (duration, title) = pending.take().unwrap_or((0.0, None));
            segments.push(Segment {
                index: segments.len() as u64,
                uri,
                duration,
                title,
                encryption: current_key.clone(),
            });
        }
    }

    if segments.is_empty() {
        return Err(DownloadError::EmptyPlaylist);
    }

    for segment in &segments {
        if target_duration > 0 && segment.duration > target_duration as f64 {
            if strict {
                return Err(DownloadError::invalid_playlist(format!(
                    "segment {} duration {}s exceeds target duration {}s",
                    segment.index, segment.duration, target_duration
                )));
            }
            warn!(
                index = segment.index,
                duration = segment.duration,
                target_duration,
                "Segment duration exceeds target duration"
            );
        }
    }

    Ok(Playlist {
        segments,
        target_duration,
        media_sequence,
        end_list,
    })
}

fn parse_extinf(rest: &str, line_no: usize) -> Result<(f64, Option<String>), DownloadError> {
    let (duration_str, title) = match rest.split_once(',') {
        Some((d, t)) => (d, Some(t)),
        None => (rest, None),
    };
    let duration = duration_str.trim().parse::<f64>().map_err(|e| {
        DownloadError::invalid_playlist(format!(
            "bad EXTINF duration `{duration_str}` on line {line_no}: {e}"
        ))
    })?;
    if duration < 0.0 {
        return Err(DownloadError::invalid_playlist(format!(
            "negative EXTINF duration on line {line_no}"
        )));
    }
    let title = title.map(str::trim).filter(|t| !t.is_empty()).map(String::from);
    Ok((duration, title))
}

fn parse_key(
    rest: &str,
    base: &Url,
    line_no: usize,
) -> Result<Option<EncryptionSpec>, DownloadError> {
    let attrs = parse_attributes(rest);
    let method = attr_value(&attrs, "METHOD").ok_or_else(|| {
        DownloadError::invalid_playlist(format!("EXT-X-KEY without METHOD on line {line_no}"))
    })?;

    match method {
        "NONE" => Ok(None),
        "AES-128" => {
            let uri = attr_value(&attrs, "URI").ok_or_else(|| {
                DownloadError::invalid_playlist(format!(
                    "AES-128 key without URI on line {line_no}"
                ))
            })?;
            let key_uri = base.join(uri).map_err(|e| {
                DownloadError::invalid_playlist(format!(
                    "cannot resolve key URI `{uri}` on line {line_no}: {e}"
                ))
            })?;
            let iv = attr_value(&attrs, "IV").map(|v| parse_iv(v, line_no)).transpose()?;
            Ok(Some(EncryptionSpec::new(
                EncryptionMethod::Aes128,
                key_uri,
                iv,
            )))
        }
        other => Err(DownloadError::invalid_playlist(format!(
            "unsupported encryption method `{other}` on line {line_no}"
        ))),
    }
}

fn parse_iv(value: &str, line_no: usize) -> Result<[u8; 16], DownloadError> {
    let hex_digits = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .ok_or_else(|| {
            DownloadError::invalid_config(format!("IV `{value}` on line {line_no} must begin 0x"))
        })?;
    let mut iv = [0u8; 16];
    hex::decode_to_slice(hex_digits, &mut iv).map_err(|e| {
        DownloadError::invalid_config(format!(
            "IV `{value}` on line {line_no} must be 32 hex digits: {e}"
        ))
    })?;
    Ok(iv)
}

/// Split a `KEY=VALUE,KEY="VAL,UE"` attribute list on commas, keeping quoted
/// values intact, and strip the quotes.
fn parse_attributes(rest: &str) -> Vec<(String, String)> {
    let mut parts: Vec<&str> = Vec::new();
    let mut in_quotes = false;
    let mut start = 0usize;
    for (idx, ch) in rest.char_indices() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(rest[start..idx].trim());
                start = idx + 1;
            }
            _ => {}
        }
    }
    if start < rest.len() {
        parts.push(rest[start..].trim());
    }

    parts
        .into_iter()
        .filter(|p| !p.is_empty())
        .filter_map(|part| {
            let (k, v) = part.split_once('=')?;
            let mut val = v.trim();
            if let Some(stripped) = val.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
                val = stripped;
            }
            Some((k.trim().to_string(), val.to_string()))
        })
        .collect()
}

fn attr_value<'a>(attrs: &'a [(String, String)], key: &str) -> Option<&'a str> {
    attrs
        .iter()
        .find(|(k, _)| k.eq_ignore_ascii_case(key))
        .map(|(_, v)| v.as_str())
}

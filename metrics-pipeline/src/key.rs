use std::{
    borrow::Cow,
    fmt,
    hash::{Hash, Hasher},
    sync::Arc,
};

use rapidhash::fast::RapidHasher;

/// Kind of a metric.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum MetricKind {
    /// Monotonically accumulated total.
    Counter,

    /// Last-written value.
    Gauge,

    /// Distribution of observations across fixed buckets.
    Histogram,
}

impl MetricKind {
    /// Returns a short, lowercase name for the kind.
    pub const fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A key/value pair attached to a metric.
///
/// Tags order by key, then by value.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct Tag {
    key: Cow<'static, str>,
    value: Cow<'static, str>,
}

impl Tag {
    /// Creates a new `Tag`.
    pub fn new<K, V>(key: K, value: V) -> Self
    where
        K: Into<Cow<'static, str>>,
        V: Into<Cow<'static, str>>,
    {
        Self { key: key.into(), value: value.into() }
    }

    /// Creates a new `Tag` from static strings without allocating.
    pub const fn from_static(key: &'static str, value: &'static str) -> Self {
        Self { key: Cow::Borrowed(key), value: Cow::Borrowed(value) }
    }

    /// Returns the tag key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Returns the tag value.
    pub fn value(&self) -> &str {
        &self.value
    }
}

impl<K, V> From<(K, V)> for Tag
where
    K: Into<Cow<'static, str>>,
    V: Into<Cow<'static, str>>,
{
    fn from((key, value): (K, V)) -> Self {
        Tag::new(key, value)
    }
}

impl From<&Tag> for Tag {
    fn from(tag: &Tag) -> Self {
        tag.clone()
    }
}

/// Builds the canonical encoded identity of a metric name and its tags.
///
/// The result is `name?k1=v1&k2=v2` with tags sorted by key and then value, so any permutation of the same tags
/// produces the same string. A metric without tags encodes as `name?`. The characters `%`, `&`, `=`, and `?` are
/// percent-escaped wherever they appear in a name, key, or value, so distinct inputs never collide.
pub fn make_key(name: &str, tags: &[Tag]) -> String {
    let mut sorted = tags.iter().collect::<Vec<_>>();
    sorted.sort();
    encode(name, sorted)
}

fn encode<'a, I>(name: &str, tags: I) -> String
where
    I: IntoIterator<Item = &'a Tag>,
{
    let mut encoded = String::with_capacity(name.len() + 1);
    escape_into(&mut encoded, name);
    encoded.push('?');
    for (i, tag) in tags.into_iter().enumerate() {
        if i > 0 {
            encoded.push('&');
        }
        escape_into(&mut encoded, tag.key());
        encoded.push('=');
        escape_into(&mut encoded, tag.value());
    }
    encoded
}

fn escape_into(out: &mut String, raw: &str) {
    for c in raw.chars() {
        match c {
            '%' => out.push_str("%25"),
            '&' => out.push_str("%26"),
            '=' => out.push_str("%3D"),
            '?' => out.push_str("%3F"),
            c => out.push(c),
        }
    }
}

// Only needs to be stable within a process: it picks the series bucket inside an entry, and collisions fall back to
// comparing the tags themselves.
pub(crate) fn hash_tags(tags: &[Tag]) -> u64 {
    let mut hasher = RapidHasher::default();
    tags.hash(&mut hasher);
    hasher.finish()
}

struct Inner {
    kind: MetricKind,
    name: String,
    tags: Vec<Tag>,
    encoded: String,
    tags_hash: u64,
}

/// Canonical identity of a metric: its kind, name, and sorted tags.
///
/// Keys are cheap to clone and are meant to be built once and cached by callers, such as the handles returned from
/// [`Client`][crate::Client], rather than rebuilt on every update.
#[derive(Clone)]
pub struct MetricKey {
    inner: Arc<Inner>,
}

impl MetricKey {
    /// Creates a new `MetricKey`.
    pub fn new<N, I, T>(kind: MetricKind, name: N, tags: I) -> Self
    where
        N: Into<String>,
        I: IntoIterator<Item = T>,
        T: Into<Tag>,
    {
        let name = name.into();
        let mut tags = tags.into_iter().map(Into::into).collect::<Vec<_>>();
        tags.sort();

        let encoded = encode(&name, &tags);
        let tags_hash = hash_tags(&tags);

        Self { inner: Arc::new(Inner { kind, name, tags, encoded, tags_hash }) }
    }

    /// Returns the metric kind.
    pub fn kind(&self) -> MetricKind {
        self.inner.kind
    }

    /// Returns the metric name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the tags, sorted by key and then value.
    pub fn tags(&self) -> &[Tag] {
        &self.inner.tags
    }

    /// Returns the encoded identity, as produced by [`make_key`].
    pub fn encoded(&self) -> &str {
        &self.inner.encoded
    }

    pub(crate) fn tags_hash(&self) -> u64 {
        self.inner.tags_hash
    }
}

impl PartialEq for MetricKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
            || (self.inner.kind == other.inner.kind && self.inner.encoded == other.inner.encoded)
    }
}

impl Eq for MetricKey {}

impl Hash for MetricKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.kind.hash(state);
        self.inner.encoded.hash(state);
    }
}

impl fmt::Debug for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricKey")
            .field("kind", &self.inner.kind)
            .field("key", &self.inner.encoded)
            .finish()
    }
}

impl fmt::Display for MetricKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.encoded)
    }
}

//! Identifier fingerprinting.
//!
//! Every name in the markup language (declarations, variables, tokens,
//! blocks, file base names) is reduced to a 32-bit FNV-1a hash and all
//! scope/index lookups happen on those hashes. A handful of well-known
//! names are pre-hashed as constants so the renderer can recognise them
//! without string comparisons.

/// 32-bit FNV-1a over the raw bytes of a name.
pub const fn new_hash(input: &str) -> u32 {
    const OFFSET: u32 = 2_166_136_261;
    const PRIME: u32 = 16_777_619;

    let bytes = input.as_bytes();
    let mut hash = OFFSET;
    let mut i = 0;

    while i < bytes.len() {
        hash ^= bytes[i] as u32;
        hash = hash.wrapping_mul(PRIME);
        i += 1;
    }

    hash
}

/// `%` — the anonymous binding a token/block invocation exposes to its body.
pub const BASE_HASH: u32 = new_hash("%");
/// `it` — the per-iteration binding inside `for` bodies and tag passes.
pub const IT_HASH: u32 = new_hash("it");
/// `.` — the explicit default-paragraph token.
pub const STOP_HASH: u32 = new_hash(".");
/// `index` — directory hits resolve to this child.
pub const INDEX_HASH: u32 = new_hash("index");
/// `default` — the wrapper applied to plain paragraphs.
pub const DEFAULT_HASH: u32 = new_hash("default");
/// `taginator` — marks a page as a tag-family generator.
pub const TAGINATOR_HASH: u32 = new_hash("taginator");
/// `plate` — names the declaration-merging parent document.
pub const PLATE_HASH: u32 = new_hash("plate");
/// `date` — the declaration the date expression reads.
pub const DATE_HASH: u32 = new_hash("date");

/// Computed metadata exposed on the iteration binding.
pub const INFO_SLUG_HASH: u32 = new_hash("info.slug");
pub const INFO_URL_HASH: u32 = new_hash("info.url");
pub const INFO_DATE_HASH: u32 = new_hash("info.date");

//! Markup extraction boundary
//!
//! The service speaks HTML on its read endpoints. These helpers pull the
//! handful of attributes the bot needs out of a page; required fields are
//! validated here so the core never sees a half-formed record.

use crate::types::{BoostTarget, InventoryInstance, Owner, QuotaSnapshot};

/// Value of the first `attr="..."` occurrence in `fragment`.
pub fn find_attr<'a>(fragment: &'a str, attr: &str) -> Option<&'a str> {
    let needle = format!("{}=\"", attr);
    let start = fragment.find(&needle)? + needle.len();
    let rest = &fragment[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn attr_u64(fragment: &str, attr: &str) -> Option<u64> {
    find_attr(fragment, attr)?.trim().parse().ok()
}

fn attr_u32(fragment: &str, attr: &str) -> Option<u32> {
    find_attr(fragment, attr)?.trim().parse().ok()
}

/// Split a page into per-record fragments, one per occurrence of `attr`.
///
/// Each fragment starts at an occurrence and runs to the next one, so
/// `find_attr` on a fragment reads that record's attributes only.
fn records<'a>(page: &'a str, attr: &str) -> Vec<&'a str> {
    let needle = format!("{}=\"", attr);
    let mut starts: Vec<usize> = Vec::new();
    let mut from = 0;
    while let Some(pos) = page[from..].find(&needle) {
        starts.push(from + pos);
        from += pos + needle.len();
    }
    let mut out = Vec::with_capacity(starts.len());
    for (i, &s) in starts.iter().enumerate() {
        let end = starts.get(i + 1).copied().unwrap_or(page.len());
        out.push(&page[s..end]);
    }
    out
}

/// Extract the csrf token from a page.
///
/// Checks the `csrf-token` meta tag first, then a hidden `_token` input.
pub fn csrf_token(page: &str) -> Option<String> {
    if let Some(pos) = page.find("name=\"csrf-token\"") {
        let tag = tag_around(page, pos);
        if let Some(token) = find_attr(tag, "content") {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }
    }
    if let Some(pos) = page.find("name=\"_token\"") {
        let tag = tag_around(page, pos);
        if let Some(token) = find_attr(tag, "value") {
            if !token.trim().is_empty() {
                return Some(token.trim().to_string());
            }
        }
    }
    None
}

/// The `<...>` tag enclosing byte offset `pos`.
fn tag_around(page: &str, pos: usize) -> &str {
    let start = page[..pos].rfind('<').unwrap_or(0);
    let end = page[pos..]
        .find('>')
        .map(|e| pos + e + 1)
        .unwrap_or(page.len());
    &page[start..end]
}

/// The boost target record on the club page.
pub fn boost_target(page: &str) -> Option<BoostTarget> {
    let frag = records(page, "data-card-id").into_iter().next()?;
    Some(BoostTarget {
        item_id: attr_u64(frag, "data-card-id")?,
        display_name: find_attr(frag, "data-card-name")?.to_string(),
        tier: find_attr(frag, "data-card-rank")?.to_string(),
        owners_count: attr_u32(frag, "data-owners")?,
        wanters_count: attr_u32(frag, "data-wanters")?,
    })
}

/// Remaining daily quotas from the club page.
pub fn quota(page: &str) -> Option<QuotaSnapshot> {
    Some(QuotaSnapshot {
        donations_remaining: attr_u32(page, "data-donations-left")?,
        replacements_remaining: attr_u32(page, "data-replacements-left")?,
    })
}

/// Demand count from a card's wanters page.
pub fn want_count(page: &str) -> Option<u32> {
    attr_u32(page, "data-want-count")
}

/// Owner records from a target's owners page. Records missing an id are
/// dropped; a missing name falls back to empty.
pub fn owners(page: &str) -> Vec<Owner> {
    records(page, "data-owner-id")
        .into_iter()
        .filter_map(|frag| {
            Some(Owner {
                user_id: attr_u64(frag, "data-owner-id")?,
                username: find_attr(frag, "data-owner-name")
                    .unwrap_or_default()
                    .to_string(),
            })
        })
        .collect()
}

/// Inventory instances from the account's cards page.
pub fn inventory(page: &str) -> Vec<InventoryInstance> {
    records(page, "data-instance-id")
        .into_iter()
        .filter_map(|frag| {
            Some(InventoryInstance {
                instance_id: attr_u64(frag, "data-instance-id")?,
                item_id: attr_u64(frag, "data-card-id")?,
                tier: find_attr(frag, "data-rank")?.to_string(),
            })
        })
        .collect()
}

/// Offer ids from the outgoing-offers page.
pub fn offer_ids(page: &str) -> Vec<String> {
    records(page, "data-offer-id")
        .into_iter()
        .filter_map(|frag| find_attr(frag, "data-offer-id").map(str::to_string))
        .collect()
}

/// Completed-trade total from the history page.
pub fn history_total(page: &str) -> Option<u64> {
    attr_u64(page, "data-completed-total")
}

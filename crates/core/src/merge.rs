//! Recursive structural merge of two documents.
//!
//! Rules:
//! - mapping + mapping: keys missing in base are inserted, containers on both
//!   sides recurse, anything else is overwritten by the patch value.
//! - sequence + sequence: overlapping prefix merges element-wise by index, a
//!   longer patch appends its tail verbatim, a shorter patch never truncates.
//! - null on either side is shape-neutral: the patch value wins.
//! - any other shape disagreement is `ShapeMismatch`.
//!
//! Identity fields (`kind`, `metadata.name`, `metadata.namespace`) of the root
//! document may be filled in but never changed, and their ancestors (the root,
//! `metadata`) may not be nulled out while they hold one.

use crate::{Document, FleetError, FleetResult};

const IDENTITY_PATHS: &[&[&str]] = &[&["kind"], &["metadata", "name"], &["metadata", "namespace"]];

pub fn merge(base: &Document, patch: &Document) -> FleetResult<Document> {
    let mut out = base.clone();
    let mut path: Vec<String> = Vec::new();
    guard_identity(&path, base, patch)?;
    merge_into(&mut out, patch, &mut path)?;
    Ok(out)
}

fn render(path: &[String]) -> String {
    if path.is_empty() { "<root>".to_string() } else { path.join(".") }
}

fn under<'a>(path: &[String], identity: &'a [&'a str]) -> Option<&'a [&'a str]> {
    (identity.len() > path.len() && identity.iter().zip(path).all(|(a, b)| a == b)).then(|| &identity[path.len()..])
}

fn guard_identity(path: &[String], base: &Document, patch: &Document) -> FleetResult<()> {
    if patch.is_null() {
        let held = IDENTITY_PATHS.iter().filter_map(|p| under(path, p)).find_map(|rest| base.at(rest).filter(|d| !d.is_null()));
        if let Some(held) = held {
            return Err(FleetError::IdentityChange {
                field: render(path),
                from: held.scalar_token().unwrap_or_else(|| base.shape().to_string()),
                to: patch.shape().to_string(),
            });
        }
    }
    let is_identity = IDENTITY_PATHS.iter().any(|p| p.len() == path.len() && p.iter().zip(path).all(|(a, b)| a == b));
    if !is_identity || base.is_null() || base == patch {
        return Ok(());
    }
    Err(FleetError::IdentityChange {
        field: render(path),
        from: base.scalar_token().unwrap_or_else(|| base.shape().to_string()),
        to: patch.scalar_token().unwrap_or_else(|| patch.shape().to_string()),
    })
}

fn merge_into(base: &mut Document, patch: &Document, path: &mut Vec<String>) -> FleetResult<()> {
    match (&mut *base, patch) {
        (Document::Map(b), Document::Map(p)) => {
            for (k, pv) in p {
                path.push(k.clone());
                match b.get_mut(k) {
                    None => { b.insert(k.clone(), pv.clone()); }
                    Some(bv) => {
                        guard_identity(path, bv, pv)?;
                        merge_into(bv, pv, path)?;
                    }
                }
                path.pop();
            }
            Ok(())
        }
        (Document::Seq(b), Document::Seq(p)) => {
            for (i, pv) in p.iter().enumerate() {
                if let Some(bv) = b.get_mut(i) {
                    path.push(i.to_string());
                    merge_into(bv, pv, path)?;
                    path.pop();
                } else {
                    b.push(pv.clone());
                }
            }
            Ok(())
        }
        (b, p) if b.is_null() || p.is_null() || (!b.is_container() && !p.is_container()) => {
            *b = p.clone();
            Ok(())
        }
        (b, p) => Err(FleetError::ShapeMismatch { path: render(path), base: b.shape(), patch: p.shape() }),
    }
}

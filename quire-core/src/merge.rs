//! Three-way merge strategy table.
//!
//! When the server reports that the client's base is stale, the engine
//! has three versions of the same document: the common ancestor (`base`),
//! what the server holds now (`server`) and what the user edited
//! (`client`). The merge picks a strategy by content shape:
//!
//! ```text
//! shape      strategy          rule
//! ────────── ───────────────── ─────────────────────────────────────────
//! entities   merge_entities    union by id, per-entity three-way merge
//! fields     merge_fields      per-key three-way merge
//! text       merge_text        client == base ? server : client
//! ```
//!
//! Every strategy is a pure function. A slot (key, entity or nested field)
//! changed on only one side takes that side. A slot changed differently on
//! both sides is a collision, handled by [`FieldCollisionPolicy`]: either
//! the merge stays unresolved with the colliding paths listed, or the
//! client value wins and the server value is kept as a [`Tombstone`].
//!
//! Reference: Kleppmann — DDIA, Chapter 5 (Handling Write Conflicts)

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};

use crate::diff::join_path;
use crate::{ContentBody, ContentShape, Document, Entity};

/// What to do when both sides changed the same field differently.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldCollisionPolicy {
    /// Leave the merge unresolved and report the colliding fields.
    #[default]
    HoldPending,
    /// Keep the client value, record the server value as a tombstone.
    ClientWinsWithTombstone,
}

/// A field both sides changed to different values.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub path: String,
    pub base: Option<Value>,
    pub server: Option<Value>,
    pub client: Option<Value>,
}

/// A value the merge discarded, kept for later inspection.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub path: String,
    pub discarded: Option<Value>,
    pub kept: Option<Value>,
}

/// Result of a three-way merge.
#[derive(Clone, Debug, PartialEq)]
pub enum MergeOutcome {
    /// Every slot merged cleanly (possibly with tombstones).
    Merged {
        document: Document,
        tombstones: Vec<Tombstone>,
    },
    /// At least one field collided under `HoldPending`. `partial` carries
    /// the client value in each colliding slot.
    Conflicted {
        partial: Document,
        conflicts: Vec<FieldConflict>,
        tombstones: Vec<Tombstone>,
    },
}

impl MergeOutcome {
    pub fn is_merged(&self) -> bool {
        matches!(self, MergeOutcome::Merged { .. })
    }

    /// The merged document, if the merge fully resolved.
    pub fn merged(&self) -> Option<&Document> {
        match self {
            MergeOutcome::Merged { document, .. } => Some(document),
            MergeOutcome::Conflicted { .. } => None,
        }
    }
}

/// Merge errors (the merge cannot even be attempted).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MergeError {
    #[error("cannot merge {server} server content with {client} client content")]
    ShapeMismatch {
        server: ContentShape,
        client: ContentShape,
    },
}

/// A strategy: `(base, server, client) -> merged body`.
pub type MergeStrategy = fn(&ContentBody, &ContentBody, &ContentBody, &mut MergeCtx) -> ContentBody;

/// Strategy table keyed by content shape.
pub fn strategy_for(shape: ContentShape) -> MergeStrategy {
    match shape {
        ContentShape::Entities => merge_entities,
        ContentShape::Fields => merge_fields,
        ContentShape::Text => merge_text,
    }
}

/// Collects collisions and tombstones while a strategy runs.
#[derive(Debug)]
pub struct MergeCtx {
    policy: FieldCollisionPolicy,
    conflicts: Vec<FieldConflict>,
    tombstones: Vec<Tombstone>,
}

impl MergeCtx {
    pub fn new(policy: FieldCollisionPolicy) -> Self {
        Self {
            policy,
            conflicts: Vec::new(),
            tombstones: Vec::new(),
        }
    }

    /// Both sides changed `path` differently: apply the policy.
    fn collide(
        &mut self,
        path: String,
        base: Option<&Value>,
        server: Option<&Value>,
        client: Option<&Value>,
    ) -> Option<Value> {
        match self.policy {
            FieldCollisionPolicy::HoldPending => self.conflicts.push(FieldConflict {
                path,
                base: base.cloned(),
                server: server.cloned(),
                client: client.cloned(),
            }),
            FieldCollisionPolicy::ClientWinsWithTombstone => self.tombstones.push(Tombstone {
                path,
                discarded: server.cloned(),
                kept: client.cloned(),
            }),
        }
        client.cloned()
    }

    fn tombstone(&mut self, path: String, discarded: Option<&Value>, kept: Option<&Value>) {
        self.tombstones.push(Tombstone {
            path,
            discarded: discarded.cloned(),
            kept: kept.cloned(),
        });
    }
}

/// Three-way merge of two divergent edits against their common ancestor.
///
/// `base = None` means the ancestor is unknown; every slot then counts as
/// added on whichever side has it.
pub fn three_way_merge(
    base: Option<&Document>,
    server: &Document,
    client: &Document,
    policy: FieldCollisionPolicy,
) -> Result<MergeOutcome, MergeError> {
    let shape = client.shape();
    if server.shape() != shape {
        return Err(MergeError::ShapeMismatch {
            server: server.shape(),
            client: shape,
        });
    }

    let empty = ContentBody::empty(shape);
    let base_body = match base {
        Some(doc) if doc.shape() == shape => &doc.body,
        _ => &empty,
    };

    let mut ctx = MergeCtx::new(policy);
    let body = strategy_for(shape)(base_body, &server.body, &client.body, &mut ctx);

    let base_title = base.and_then(|b| b.title.as_deref()).map(Value::from);
    let server_title = server.title.as_deref().map(Value::from);
    let client_title = client.title.as_deref().map(Value::from);
    let title = merge_slot(
        "title",
        base_title.as_ref(),
        server_title.as_ref(),
        client_title.as_ref(),
        &mut ctx,
    )
    .and_then(|v| v.as_str().map(str::to_string));

    let document = Document {
        schema_version: server.schema_version.max(client.schema_version),
        doc_type: client.doc_type.clone(),
        title,
        body,
    };

    let MergeCtx {
        conflicts,
        tombstones,
        ..
    } = ctx;

    if conflicts.is_empty() {
        Ok(MergeOutcome::Merged {
            document,
            tombstones,
        })
    } else {
        log::debug!("merge left {} colliding field(s) unresolved", conflicts.len());
        Ok(MergeOutcome::Conflicted {
            partial: document,
            conflicts,
            tombstones,
        })
    }
}

/// Three-way merge of one slot. `None` means "absent".
fn merge_slot(
    path: &str,
    base: Option<&Value>,
    server: Option<&Value>,
    client: Option<&Value>,
    ctx: &mut MergeCtx,
) -> Option<Value> {
    if server == client {
        return client.cloned();
    }
    if server == base {
        return client.cloned();
    }
    if client == base {
        return server.cloned();
    }
    match (server, client) {
        (Some(Value::Object(s)), Some(Value::Object(c))) => {
            let empty = Map::new();
            let b = match base {
                Some(Value::Object(b)) => b,
                _ => &empty,
            };
            Some(Value::Object(merge_maps(path, b, s, c, ctx)))
        }
        _ => ctx.collide(path.to_string(), base, server, client),
    }
}

fn merge_maps(
    path: &str,
    base: &Map<String, Value>,
    server: &Map<String, Value>,
    client: &Map<String, Value>,
    ctx: &mut MergeCtx,
) -> Map<String, Value> {
    let mut keys: Vec<&String> = client.keys().collect();
    for key in server.keys().chain(base.keys()) {
        if !client.contains_key(key) && !keys.contains(&key) {
            keys.push(key);
        }
    }

    let mut merged = Map::new();
    for key in keys {
        let child = join_path(path, key);
        if let Some(value) = merge_slot(&child, base.get(key), server.get(key), client.get(key), ctx)
        {
            merged.insert(key.clone(), value);
        }
    }
    merged
}

/// Entity arrays: union by `id`, three-way merge per entity.
///
/// Order follows the client, with entities only the server knows appended
/// in server order.
pub fn merge_entities(
    base: &ContentBody,
    server: &ContentBody,
    client: &ContentBody,
    ctx: &mut MergeCtx,
) -> ContentBody {
    let (ContentBody::Entities(s), ContentBody::Entities(c)) = (server, client) else {
        return client.clone();
    };
    let b: &[Entity] = match base {
        ContentBody::Entities(b) => b,
        _ => &[],
    };

    let index = |items: &[Entity]| -> BTreeMap<String, Value> {
        items.iter().map(|e| (e.id.clone(), e.fields_value())).collect()
    };
    let (bi, si, ci) = (index(b), index(s), index(c));

    let mut order: Vec<&str> = c.iter().map(|e| e.id.as_str()).collect();
    let mut seen: HashSet<&str> = order.iter().copied().collect();
    for e in s.iter().chain(b.iter()) {
        if seen.insert(e.id.as_str()) {
            order.push(e.id.as_str());
        }
    }

    let mut merged = Vec::with_capacity(order.len());
    for id in order {
        let path = join_path("body", id);
        let value = merge_slot(&path, bi.get(id), si.get(id), ci.get(id), ctx);
        if let Some(value) = value {
            merged.push(Entity {
                id: id.to_string(),
                fields: object_fields(value),
            });
        }
    }
    ContentBody::Entities(merged)
}

/// Object content: per-key three-way merge.
pub fn merge_fields(
    base: &ContentBody,
    server: &ContentBody,
    client: &ContentBody,
    ctx: &mut MergeCtx,
) -> ContentBody {
    let (ContentBody::Fields(s), ContentBody::Fields(c)) = (server, client) else {
        return client.clone();
    };
    let b = match base {
        ContentBody::Fields(b) => b.clone(),
        _ => BTreeMap::new(),
    };
    let to_map = |m: &BTreeMap<String, Value>| -> Map<String, Value> {
        m.clone().into_iter().collect()
    };

    let merged = merge_maps("body", &to_map(&b), &to_map(s), &to_map(c), ctx);
    ContentBody::Fields(merged.into_iter().collect())
}

/// Scalar / text content: if the client never moved off the base, take
/// the server; otherwise keep the client. A diverged server value is
/// kept as a tombstone.
pub fn merge_text(
    base: &ContentBody,
    server: &ContentBody,
    client: &ContentBody,
    ctx: &mut MergeCtx,
) -> ContentBody {
    let (ContentBody::Text(s), ContentBody::Text(c)) = (server, client) else {
        return client.clone();
    };
    let b = match base {
        ContentBody::Text(b) => b.as_str(),
        _ => "",
    };

    if c == b {
        return ContentBody::Text(s.clone());
    }
    if s != b && s != c {
        ctx.tombstone(
            "body".into(),
            Some(&Value::from(s.as_str())),
            Some(&Value::from(c.as_str())),
        );
    }
    ContentBody::Text(c.clone())
}

fn object_fields(value: Value) -> BTreeMap<String, Value> {
    match value {
        Value::Object(map) => map.into_iter().collect(),
        _ => BTreeMap::new(),
    }
}

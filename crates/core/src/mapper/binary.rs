//! Binary linear model format and the typed-context mapper built on it.
//!
//! Layout (little endian):
//!
//! ```text
//! magic "MWTB" | version u16 | num_actions u32 | num_features u32 | temperature f32
//! num_features x (name_len u16, name utf-8)
//! num_features x num_actions weights f32 (row per feature)
//! num_actions bias f32
//! ```

use std::{collections::BTreeMap, sync::Arc};

use super::{
    linear::check_action_count, read_model, ActionProbability, ContextMapper, LinearPolicy,
    ModelStream, TypeInspector,
};
use crate::error::{DecisionServiceError, Result};

const MAGIC: &[u8; 4] = b"MWTB";
const VERSION: u16 = 1;

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| DecisionServiceError::mapper("binary model truncated"))?;
        let slice = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.take(N)?);
        Ok(out)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_le_bytes(self.array()?))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array()?))
    }

    fn f32(&mut self) -> Result<f32> {
        Ok(f32::from_le_bytes(self.array()?))
    }
}

impl LinearPolicy {
    pub fn from_binary(bytes: &[u8]) -> Result<Self> {
        let mut cur = Cursor { bytes, pos: 0 };
        if cur.take(4)? != MAGIC {
            return Err(DecisionServiceError::mapper("not an MWTB model"));
        }
        let version = cur.u16()?;
        if version != VERSION {
            return Err(DecisionServiceError::mapper(format!(
                "unsupported MWTB version {version}"
            )));
        }
        let num_actions = cur.u32()?;
        check_action_count(num_actions)?;
        let num_features = cur.u32()? as usize;
        let temperature = cur.f32()?;

        let mut names = Vec::new();
        for _ in 0..num_features {
            let len = cur.u16()? as usize;
            let name = std::str::from_utf8(cur.take(len)?)
                .map_err(|_| DecisionServiceError::mapper("feature name is not UTF-8"))?;
            names.push(name.to_string());
        }

        let mut weights = BTreeMap::new();
        for name in names {
            let row = (0..num_actions)
                .map(|_| cur.f32())
                .collect::<Result<Vec<_>>>()?;
            weights.insert(name, row);
        }
        let bias = (0..num_actions)
            .map(|_| cur.f32())
            .collect::<Result<Vec<_>>>()?;

        if cur.pos != bytes.len() {
            return Err(DecisionServiceError::mapper("trailing bytes after binary model"));
        }

        let policy = LinearPolicy {
            num_actions,
            weights,
            bias,
            temperature,
        };
        policy.validate()?;
        Ok(policy)
    }

    /// Encodes a validated policy. Fails instead of truncating lengths that
    /// do not fit the format.
    pub fn to_binary(&self) -> Result<Vec<u8>> {
        self.validate()?;
        let num_features = u32::try_from(self.weights.len())
            .map_err(|_| DecisionServiceError::mapper("too many features for MWTB"))?;
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&VERSION.to_le_bytes());
        out.extend_from_slice(&self.num_actions.to_le_bytes());
        out.extend_from_slice(&num_features.to_le_bytes());
        out.extend_from_slice(&self.temperature.to_le_bytes());
        for name in self.weights.keys() {
            let len = u16::try_from(name.len()).map_err(|_| {
                DecisionServiceError::mapper(format!(
                    "feature name of {} bytes exceeds the MWTB limit of {}",
                    name.len(),
                    u16::MAX
                ))
            })?;
            out.extend_from_slice(&len.to_le_bytes());
            out.extend_from_slice(name.as_bytes());
        }
        for row in self.weights.values() {
            for w in row {
                out.extend_from_slice(&w.to_le_bytes());
            }
        }
        let bias = if self.bias.is_empty() {
            vec![0.0; self.num_actions as usize]
        } else {
            self.bias.clone()
        };
        for b in bias {
            out.extend_from_slice(&b.to_le_bytes());
        }
        Ok(out)
    }
}

/// Maps typed contexts through a binary linear model.
pub struct BinaryModelMapper<C> {
    policy: LinearPolicy,
    inspector: Arc<dyn TypeInspector<C>>,
    development_mode: bool,
}

impl<C> BinaryModelMapper<C> {
    pub fn new(
        model: ModelStream,
        inspector: Arc<dyn TypeInspector<C>>,
        development_mode: bool,
    ) -> Result<Self> {
        let bytes = read_model(model)?;
        let policy = LinearPolicy::from_binary(&bytes)?;
        tracing::debug!(
            actions = policy.num_actions,
            features = policy.weights.len(),
            "binary model loaded"
        );
        Ok(Self {
            policy,
            inspector,
            development_mode,
        })
    }

    pub fn policy(&self) -> &LinearPolicy {
        &self.policy
    }
}

impl<C> ContextMapper<C> for BinaryModelMapper<C> {
    fn map_context(&self, context: &C) -> Result<Vec<ActionProbability>> {
        let features = self.inspector.features(context)?;
        if self.development_mode {
            let unknown: Vec<&str> = features
                .iter()
                .map(|(name, _)| name.as_str())
                .filter(|name| !self.policy.has_feature(name))
                .collect();
            tracing::debug!(?features, ?unknown, "binary mapper features");
        }
        Ok(self.policy.distribution(&features))
    }

    fn num_actions(&self) -> Option<u32> {
        Some(self.policy.num_actions)
    }
}

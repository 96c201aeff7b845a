use crate::error::{DataSetError, Result};
use crate::model::{DataSet, Id, Parameter};
use serde::Serialize;
use std::sync::Arc;

/// Where a resolved value came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ValueSource {
    /// Override recorded on the row reached after `hop` chain steps
    Override { hop: usize, data_set_id: Id },
    /// The target row's own parameter
    Natural { data_set_id: Id },
    /// The chain broke at `hop`: no data set reference where one was needed
    Unreachable { hop: usize },
    /// The chain was intact but the target row holds no value
    Missing,
}

#[derive(Debug, Clone)]
pub struct ResolvedValue {
    pub parameter: Option<Arc<Parameter>>,
    pub source: ValueSource,
}

impl ResolvedValue {
    pub fn is_override(&self) -> bool {
        matches!(self.source, ValueSource::Override { .. })
    }

    pub fn text(&self) -> Option<&str> {
        self.parameter.as_ref().and_then(|parameter| parameter.value.as_text())
    }

    fn none(source: ValueSource) -> Self {
        Self { parameter: None, source }
    }
}

enum State {
    CheckOverride { hop: usize, row: Arc<DataSet> },
    NaturalLeaf { row: Arc<DataSet> },
    Descend { hop: usize, row: Arc<DataSet> },
}

/// Effective value of `target` reached from a row through `chain`.
///
/// Walks the chain one reference at a time, and at every row first asks for
/// an override of the remaining suffix. The nearest override wins; deeper
/// rows are not visited once one is found.
#[derive(Debug, Clone, Copy)]
pub struct OverrideResolver<'a> {
    target: &'a Id,
    chain: &'a [Id],
}

impl<'a> OverrideResolver<'a> {
    pub fn new(target: &'a Id, chain: &'a [Id]) -> Self {
        Self { target, chain }
    }

    pub fn resolve(&self, start: &Arc<DataSet>) -> Result<ResolvedValue> {
        let mut state = State::CheckOverride {
            hop: 0,
            row: start.clone(),
        };

        loop {
            state = match state {
                State::CheckOverride { hop, row } => {
                    let suffix = &self.chain[hop..];
                    if let Some(parameter) = row.override_for(self.target, suffix) {
                        return Ok(ResolvedValue {
                            parameter: Some(parameter),
                            source: ValueSource::Override {
                                hop,
                                data_set_id: row.id,
                            },
                        });
                    }
                    if suffix.is_empty() {
                        State::NaturalLeaf { row }
                    } else {
                        State::Descend { hop, row }
                    }
                }
                State::NaturalLeaf { row } => {
                    return Ok(match row.parameter(self.target) {
                        Some(parameter) => ResolvedValue {
                            parameter: Some(parameter),
                            source: ValueSource::Natural { data_set_id: row.id },
                        },
                        None => ResolvedValue::none(ValueSource::Missing),
                    });
                }
                State::Descend { hop, row } => {
                    let via = &self.chain[hop];
                    let next = match row.parameter(via) {
                        Some(parameter) => parameter.referenced_data_set()?,
                        None => None,
                    };
                    match next {
                        Some(next) => State::CheckOverride { hop: hop + 1, row: next },
                        None => {
                            log::warn!(
                                "{}",
                                DataSetError::UnreachableOverrideTarget {
                                    data_set_id: row.id,
                                    attribute_id: *via,
                                }
                            );
                            return Ok(ResolvedValue::none(ValueSource::Unreachable { hop }));
                        }
                    }
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::LazyRef;
    use crate::model::{
        generate_id, Attribute, AttributeChain, AttributePath, AttributeType, ParameterValue,
    };

    /// Three rows a -> b -> c linked by reference attributes `ab` and `bc`,
    /// with `leaf` holding the natural value on c.
    struct Chain {
        rows: [Arc<DataSet>; 3],
        ab: Id,
        bc: Id,
        leaf: Arc<Attribute>,
    }

    fn row(name: &str) -> Arc<DataSet> {
        Arc::new(DataSet::new(generate_id(), generate_id(), name.into(), 0, false))
    }

    fn link(from: &Arc<DataSet>, via: Id, to: &Arc<DataSet>) {
        from.attach_parameter(Arc::new(Parameter::direct(
            generate_id(),
            from.id,
            via,
            ParameterValue::DataSetRef(LazyRef::resolved(to.id, to)),
        )));
    }

    fn text(value: &str) -> ParameterValue {
        ParameterValue::Text(value.into())
    }

    fn chain() -> Chain {
        let rows = [row("a"), row("b"), row("c")];
        let (ab, bc) = (generate_id(), generate_id());
        let leaf = Arc::new(
            Attribute::new(generate_id(), rows[2].data_set_list_id, "city".into(), 0, AttributeType::Text, None)
                .unwrap(),
        );
        link(&rows[0], ab, &rows[1]);
        link(&rows[1], bc, &rows[2]);
        rows[2].attach_parameter(Arc::new(Parameter::direct(generate_id(), rows[2].id, leaf.id, text("natural"))));
        Chain { rows, ab, bc, leaf }
    }

    fn add_override(row: &Arc<DataSet>, chain: Vec<Id>, target: &Arc<Attribute>, value: &str) {
        let path = Arc::new(AttributePath::new(
            row.data_set_list_id,
            row.id,
            AttributeChain::new(chain),
            target.clone(),
        ));
        row.attach_parameter(Arc::new(Parameter::overlap(generate_id(), row.id, path, text(value))));
    }

    #[test]
    fn test_natural_value_without_overrides() {
        let c = chain();
        let hops = [c.ab, c.bc];
        let resolved = OverrideResolver::new(&c.leaf.id, &hops).resolve(&c.rows[0]).unwrap();

        assert_eq!(resolved.text(), Some("natural"));
        assert_eq!(resolved.source, ValueSource::Natural { data_set_id: c.rows[2].id });
    }

    #[test]
    fn test_nearest_override_wins() {
        let c = chain();
        add_override(&c.rows[1], vec![c.bc], &c.leaf, "deep");
        add_override(&c.rows[0], vec![c.ab, c.bc], &c.leaf, "near");
        let hops = [c.ab, c.bc];

        let resolved = OverrideResolver::new(&c.leaf.id, &hops).resolve(&c.rows[0]).unwrap();
        assert_eq!(resolved.text(), Some("near"));
        assert_eq!(
            resolved.source,
            ValueSource::Override {
                hop: 0,
                data_set_id: c.rows[0].id
            }
        );

        // Starting one row down only sees the deeper override
        let suffix = [c.bc];
        let resolved = OverrideResolver::new(&c.leaf.id, &suffix).resolve(&c.rows[1]).unwrap();
        assert_eq!(resolved.text(), Some("deep"));
    }

    #[test]
    fn test_deeper_override_used_when_nearer_absent() {
        let c = chain();
        add_override(&c.rows[1], vec![c.bc], &c.leaf, "deep");
        let hops = [c.ab, c.bc];

        let resolved = OverrideResolver::new(&c.leaf.id, &hops).resolve(&c.rows[0]).unwrap();
        assert_eq!(resolved.text(), Some("deep"));
        assert!(matches!(resolved.source, ValueSource::Override { hop: 1, .. }));
    }

    #[test]
    fn test_override_for_other_chain_ignored() {
        let c = chain();
        // Same target, but recorded for a chain that is only a prefix
        add_override(&c.rows[0], vec![c.ab], &c.leaf, "prefix");
        let hops = [c.ab, c.bc];

        let resolved = OverrideResolver::new(&c.leaf.id, &hops).resolve(&c.rows[0]).unwrap();
        assert_eq!(resolved.text(), Some("natural"));
    }

    #[test]
    fn test_broken_chain_is_unreachable_not_error() {
        let c = chain();
        let stray = generate_id();
        let hops = [c.ab, stray];

        let resolved = OverrideResolver::new(&c.leaf.id, &hops).resolve(&c.rows[0]).unwrap();
        assert!(resolved.parameter.is_none());
        assert_eq!(resolved.source, ValueSource::Unreachable { hop: 1 });
    }

    #[test]
    fn test_missing_leaf_value() {
        let c = chain();
        let other = generate_id();
        let hops = [c.ab, c.bc];

        let resolved = OverrideResolver::new(&other, &hops).resolve(&c.rows[0]).unwrap();
        assert_eq!(resolved.source, ValueSource::Missing);
    }
}

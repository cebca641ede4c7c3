// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Plan assembly: logical plan to physical operator tree.
//!
//! Responsibilities:
//! - Lowers each logical node to its physical operator.
//! - Creates one shared `RuntimeFilter` handle per filter id; build sides are lowered
//!   before probe sides so every probe finds its filter.
//! - Resolves `CreateFilterRef` to a weak back-reference of the build root that was
//!   already lowered for that filter id.
//!
//! Key exported interfaces:
//! - Types: `PlanLowering`, `LoweredPlan`.
//! - Functions: `lower_plan`.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use crate::common::ids::FilterId;
use crate::common::status::{ExecError, ExecResult};
use crate::exec::chunk::Chunk;
use crate::exec::operators::{
    CreateFilterOperator, FilterBuildInput, FilterGateOperator, UseFilterOperator,
    ValuesSourceOperator,
};
use crate::exec::pipeline::operator::PhysicalOperator;
use crate::exec::runtime_filter::{
    DefaultFilterBuilderFactory, FilterBuilderFactory, FilterProbe, FilterSpec, RuntimeFilter,
};
use crate::lower::plan::{LogicalFilterBuild, LogicalPlan};
use crate::predtrans_logging::debug;

/// Result of plan assembly.
pub struct LoweredPlan {
    pub root: Arc<dyn PhysicalOperator>,
    filters: HashMap<FilterId, Arc<RuntimeFilter>>,
}

impl LoweredPlan {
    pub fn filter(&self, id: FilterId) -> Option<&Arc<RuntimeFilter>> {
        self.filters.get(&id)
    }

    pub fn filters(&self) -> impl Iterator<Item = &Arc<RuntimeFilter>> {
        self.filters.values()
    }
}

/// Lower `plan` with the default builder factory.
pub fn lower_plan(plan: &LogicalPlan) -> ExecResult<LoweredPlan> {
    PlanLowering::new(Arc::new(DefaultFilterBuilderFactory)).lower(plan)
}

pub struct PlanLowering {
    builder_factory: Arc<dyn FilterBuilderFactory>,
    filters: HashMap<FilterId, Arc<RuntimeFilter>>,
    build_roots: HashMap<FilterId, Weak<CreateFilterOperator>>,
}

impl PlanLowering {
    pub fn new(builder_factory: Arc<dyn FilterBuilderFactory>) -> Self {
        Self {
            builder_factory,
            filters: HashMap::new(),
            build_roots: HashMap::new(),
        }
    }

    pub fn lower(mut self, plan: &LogicalPlan) -> ExecResult<LoweredPlan> {
        let root = self.lower_node(plan)?;
        Ok(LoweredPlan {
            root,
            filters: self.filters,
        })
    }

    fn lower_node(&mut self, plan: &LogicalPlan) -> ExecResult<Arc<dyn PhysicalOperator>> {
        match plan {
            LogicalPlan::Values { schema, batches } => {
                let chunks = batches.iter().cloned().map(Chunk::new).collect();
                Ok(Arc::new(ValuesSourceOperator::new(schema.clone(), chunks)?))
            }
            LogicalPlan::CreateFilter { input, filters } => {
                let op: Arc<dyn PhysicalOperator> = self.lower_create_filter(input, filters)?;
                Ok(op)
            }
            LogicalPlan::UseFilter { input, filters } => {
                let child = self.lower_node(input)?;
                let probes = filters
                    .iter()
                    .map(|f| {
                        let filter = self.filters.get(&f.id).cloned().ok_or_else(|| {
                            ExecError::internal(format!(
                                "runtime filter {} is used before any CreateFilter builds it",
                                f.id
                            ))
                        })?;
                        Ok(FilterProbe {
                            filter,
                            probe_columns: f.probe_columns.clone(),
                        })
                    })
                    .collect::<ExecResult<Vec<_>>>()?;
                Ok(Arc::new(UseFilterOperator::new(child, probes)?))
            }
            LogicalPlan::ApplyFilters { probe, build } => {
                let build = self.lower_build_input(build)?;
                let probe = self.lower_node(probe)?;
                Ok(Arc::new(FilterGateOperator::new(probe, build)))
            }
            LogicalPlan::CreateFilterRef { filter_id } => Err(ExecError::internal(format!(
                "CreateFilterRef({}) is only valid as the build side of ApplyFilters",
                filter_id
            ))),
        }
    }

    fn lower_build_input(&mut self, build: &LogicalPlan) -> ExecResult<FilterBuildInput> {
        match build {
            LogicalPlan::CreateFilter { input, filters } => Ok(FilterBuildInput::Owned(
                self.lower_create_filter(input, filters)?,
            )),
            LogicalPlan::CreateFilterRef { filter_id } => {
                let weak = self.build_roots.get(filter_id).cloned().ok_or_else(|| {
                    ExecError::internal(format!(
                        "CreateFilterRef({}) names no lowered filter build",
                        filter_id
                    ))
                })?;
                debug!("shared filter build root: filter_id={}", filter_id);
                Ok(FilterBuildInput::Shared(weak))
            }
            other => Err(ExecError::internal(format!(
                "ApplyFilters build side must be CreateFilter or CreateFilterRef, got {}",
                other.name()
            ))),
        }
    }

    fn lower_create_filter(
        &mut self,
        input: &LogicalPlan,
        filters: &[LogicalFilterBuild],
    ) -> ExecResult<Arc<CreateFilterOperator>> {
        let child = self.lower_node(input)?;
        let schema = child.schema();
        let mut specs = Vec::with_capacity(filters.len());
        for f in filters {
            if self.filters.contains_key(&f.id) {
                return Err(ExecError::internal(format!(
                    "runtime filter {} is built more than once",
                    f.id
                )));
            }
            let key_types = f
                .build_columns
                .iter()
                .map(|col| {
                    schema
                        .fields()
                        .get(*col)
                        .map(|field| field.data_type().clone())
                        .ok_or_else(|| {
                            ExecError::internal(format!(
                                "runtime filter {} build column {} out of range",
                                f.id, col
                            ))
                        })
                })
                .collect::<ExecResult<Vec<_>>>()?;
            let filter = RuntimeFilter::new(f.id, &key_types)?;
            self.filters.insert(f.id, Arc::clone(&filter));
            specs.push(FilterSpec::new(filter, f.build_columns.clone()));
        }
        let op = Arc::new(CreateFilterOperator::new(
            child,
            specs,
            Arc::clone(&self.builder_factory),
        )?);
        for f in filters {
            self.build_roots.insert(f.id, Arc::downgrade(&op));
        }
        Ok(op)
    }
}

#[cfg(test)]
mod tests {
    use super::lower_plan;
    use crate::common::ids::FilterId;
    use crate::lower::plan::{LogicalFilterBuild, LogicalFilterProbe, LogicalPlan};
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn values() -> LogicalPlan {
        let schema = Arc::new(Schema::new(vec![Field::new("k", DataType::Int32, false)]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![Arc::new(Int32Array::from(vec![1, 2, 3]))],
        )
        .unwrap();
        LogicalPlan::values(schema, vec![batch])
    }

    fn build(id: u32) -> LogicalPlan {
        LogicalPlan::create_filter(
            values(),
            vec![LogicalFilterBuild {
                id: FilterId::new(id),
                build_columns: vec![0],
            }],
        )
    }

    fn probe(id: u32) -> LogicalPlan {
        LogicalPlan::use_filter(
            values(),
            vec![LogicalFilterProbe {
                id: FilterId::new(id),
                probe_columns: vec![0],
            }],
        )
    }

    #[test]
    fn build_side_is_lowered_before_probe_side() {
        let lowered = lower_plan(&LogicalPlan::apply_filters(probe(1), build(1))).unwrap();
        assert_eq!(lowered.root.name(), "FilterGate");
        let filter = lowered.filter(FilterId::new(1)).unwrap();
        assert_eq!(filter.key_types(), &[DataType::Int32]);
        assert!(!filter.is_ready());
    }

    #[test]
    fn unknown_filter_reference_is_internal() {
        assert!(lower_plan(&probe(9)).err().unwrap().is_internal());
        let dangling = LogicalPlan::apply_filters(
            values(),
            LogicalPlan::CreateFilterRef {
                filter_id: FilterId::new(9),
            },
        );
        assert!(lower_plan(&dangling).err().unwrap().is_internal());
        let bad_build = LogicalPlan::apply_filters(values(), values());
        assert!(lower_plan(&bad_build).err().unwrap().is_internal());
    }

    #[test]
    fn duplicate_filter_id_is_rejected() {
        let plan = LogicalPlan::apply_filters(
            LogicalPlan::apply_filters(values(), build(2)),
            build(2),
        );
        assert!(lower_plan(&plan).err().unwrap().is_internal());
    }
}

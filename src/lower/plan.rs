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
//! Logical plan nodes for runtime filter pushdown.
//!
//! Responsibilities:
//! - Describes build/probe placement of runtime filters as a tree of logical nodes.
//! - Provides cardinality estimation and output schema derivation for plan assembly.
//! - Serializes the persistable nodes; filter nodes are execution-only and refuse.
//!
//! Key exported interfaces:
//! - Types: `LogicalPlan`, `LogicalFilterBuild`, `LogicalFilterProbe`.

use std::io::Cursor;

use arrow::datatypes::SchemaRef;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::common::ids::FilterId;
use crate::common::status::{ExecError, ExecResult};

const TAG_VALUES: u8 = 0;
const TAG_CREATE_FILTER: u8 = 1;
const TAG_USE_FILTER: u8 = 2;
const TAG_APPLY_FILTERS: u8 = 3;
const TAG_CREATE_FILTER_REF: u8 = 4;

/// One filter built by a `CreateFilter` node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalFilterBuild {
    pub id: FilterId,
    pub build_columns: Vec<usize>,
}

/// One filter applied by a `UseFilter` node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalFilterProbe {
    pub id: FilterId,
    pub probe_columns: Vec<usize>,
}

#[derive(Clone, Debug)]
pub enum LogicalPlan {
    /// In-memory rows.
    Values {
        schema: SchemaRef,
        batches: Vec<RecordBatch>,
    },
    /// Materialize `input` and build `filters` from it. Outputs `input` unfiltered.
    CreateFilter {
        input: Box<LogicalPlan>,
        filters: Vec<LogicalFilterBuild>,
    },
    /// Drop rows of `input` rejected by any of `filters`.
    UseFilter {
        input: Box<LogicalPlan>,
        filters: Vec<LogicalFilterProbe>,
    },
    /// Run `probe` once the filters built by `build` are ready. Outputs `probe`.
    ApplyFilters {
        probe: Box<LogicalPlan>,
        build: Box<LogicalPlan>,
    },
    /// The already planned `CreateFilter` node that builds `filter_id`.
    CreateFilterRef { filter_id: FilterId },
}

impl LogicalPlan {
    pub fn values(schema: SchemaRef, batches: Vec<RecordBatch>) -> Self {
        LogicalPlan::Values { schema, batches }
    }

    pub fn create_filter(input: LogicalPlan, filters: Vec<LogicalFilterBuild>) -> Self {
        LogicalPlan::CreateFilter {
            input: Box::new(input),
            filters,
        }
    }

    pub fn use_filter(input: LogicalPlan, filters: Vec<LogicalFilterProbe>) -> Self {
        LogicalPlan::UseFilter {
            input: Box::new(input),
            filters,
        }
    }

    pub fn apply_filters(probe: LogicalPlan, build: LogicalPlan) -> Self {
        LogicalPlan::ApplyFilters {
            probe: Box::new(probe),
            build: Box::new(build),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LogicalPlan::Values { .. } => "Values",
            LogicalPlan::CreateFilter { .. } => "CreateFilter",
            LogicalPlan::UseFilter { .. } => "UseFilter",
            LogicalPlan::ApplyFilters { .. } => "ApplyFilters",
            LogicalPlan::CreateFilterRef { .. } => "CreateFilterRef",
        }
    }

    /// Children in planning order: the first child determines the output.
    pub fn children(&self) -> Vec<&LogicalPlan> {
        match self {
            LogicalPlan::Values { .. } | LogicalPlan::CreateFilterRef { .. } => Vec::new(),
            LogicalPlan::CreateFilter { input, .. } | LogicalPlan::UseFilter { input, .. } => {
                vec![input.as_ref()]
            }
            LogicalPlan::ApplyFilters { probe, build } => vec![probe.as_ref(), build.as_ref()],
        }
    }

    /// Row estimate; filter nodes forward their first child.
    pub fn estimated_cardinality(&self) -> usize {
        match self {
            LogicalPlan::Values { batches, .. } => batches.iter().map(|b| b.num_rows()).sum(),
            LogicalPlan::CreateFilterRef { .. } => 0,
            _ => self
                .children()
                .first()
                .map(|child| child.estimated_cardinality())
                .unwrap_or(0),
        }
    }

    pub fn output_schema(&self) -> ExecResult<SchemaRef> {
        match self {
            LogicalPlan::Values { schema, .. } => Ok(schema.clone()),
            LogicalPlan::CreateFilter { input, .. } | LogicalPlan::UseFilter { input, .. } => {
                input.output_schema()
            }
            LogicalPlan::ApplyFilters { probe, .. } => probe.output_schema(),
            LogicalPlan::CreateFilterRef { filter_id } => Err(ExecError::internal(format!(
                "CreateFilterRef({}) has no output of its own",
                filter_id
            ))),
        }
    }

    fn tag(&self) -> u8 {
        match self {
            LogicalPlan::Values { .. } => TAG_VALUES,
            LogicalPlan::CreateFilter { .. } => TAG_CREATE_FILTER,
            LogicalPlan::UseFilter { .. } => TAG_USE_FILTER,
            LogicalPlan::ApplyFilters { .. } => TAG_APPLY_FILTERS,
            LogicalPlan::CreateFilterRef { .. } => TAG_CREATE_FILTER_REF,
        }
    }

    /// Encode a `Values` node as a tag byte followed by an Arrow IPC stream.
    pub fn serialize(&self) -> ExecResult<Vec<u8>> {
        let LogicalPlan::Values { schema, batches } = self else {
            return Err(ExecError::not_implemented(format!(
                "{} is an execution-only node and cannot be serialized",
                self.name()
            )));
        };
        let mut out = vec![self.tag()];
        {
            let mut writer = StreamWriter::try_new(&mut out, schema)?;
            for batch in batches {
                writer.write(batch)?;
            }
            writer.finish()?;
        }
        Ok(out)
    }

    pub fn deserialize(bytes: &[u8]) -> ExecResult<LogicalPlan> {
        let Some((&tag, payload)) = bytes.split_first() else {
            return Err(ExecError::internal("empty logical plan payload"));
        };
        match tag {
            TAG_VALUES => {
                let reader = StreamReader::try_new(Cursor::new(payload), None)?;
                let schema = reader.schema();
                let batches = reader.collect::<Result<Vec<_>, _>>()?;
                Ok(LogicalPlan::Values { schema, batches })
            }
            TAG_CREATE_FILTER | TAG_USE_FILTER | TAG_APPLY_FILTERS | TAG_CREATE_FILTER_REF => {
                Err(ExecError::not_implemented(format!(
                    "logical plan tag {} is execution-only and cannot be deserialized",
                    tag
                )))
            }
            other => Err(ExecError::internal(format!(
                "unknown logical plan tag {}",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{LogicalFilterBuild, LogicalFilterProbe, LogicalPlan};
    use crate::common::ids::FilterId;
    use crate::common::status::ExecError;
    use arrow::array::{Int32Array, StringArray};
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::Arc;

    fn values(rows: i32) -> LogicalPlan {
        let schema = Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int32, false),
            Field::new("v", DataType::Utf8, true),
        ]));
        let batch = RecordBatch::try_new(
            Arc::clone(&schema),
            vec![
                Arc::new(Int32Array::from_iter_values(0..rows)),
                Arc::new(StringArray::from_iter((0..rows).map(|i| Some(i.to_string())))),
            ],
        )
        .unwrap();
        LogicalPlan::values(schema, vec![batch])
    }

    #[test]
    fn filter_nodes_forward_cardinality_and_schema_of_first_child() {
        let build = LogicalPlan::create_filter(
            values(7),
            vec![LogicalFilterBuild {
                id: FilterId::new(1),
                build_columns: vec![0],
            }],
        );
        let probe = LogicalPlan::use_filter(
            values(40),
            vec![LogicalFilterProbe {
                id: FilterId::new(1),
                probe_columns: vec![0],
            }],
        );
        let plan = LogicalPlan::apply_filters(probe, build);
        assert_eq!(plan.estimated_cardinality(), 40);
        assert_eq!(plan.output_schema().unwrap().fields().len(), 2);
        assert_eq!(plan.children().len(), 2);
        let reference = LogicalPlan::CreateFilterRef {
            filter_id: FilterId::new(1),
        };
        assert!(reference.output_schema().unwrap_err().is_internal());
    }

    #[test]
    fn values_survive_ipc_but_filter_nodes_refuse() {
        let plan = values(5);
        let bytes = plan.serialize().unwrap();
        let back = LogicalPlan::deserialize(&bytes).unwrap();
        assert_eq!(back.estimated_cardinality(), 5);

        let build = LogicalPlan::create_filter(values(3), Vec::new());
        assert!(matches!(
            build.serialize(),
            Err(ExecError::NotImplemented(_))
        ));
        assert!(matches!(
            LogicalPlan::deserialize(&[3]),
            Err(ExecError::NotImplemented(_))
        ));
        assert!(LogicalPlan::deserialize(&[]).unwrap_err().is_internal());
        assert!(LogicalPlan::deserialize(&[99]).unwrap_err().is_internal());
    }
}

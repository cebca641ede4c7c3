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
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_OPERATOR_ID: AtomicU32 = AtomicU32::new(1);

/// Runtime filter id, assigned by the planner and shared by build and probe sides.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct FilterId(pub u32);

impl FilterId {
    pub const fn new(value: u32) -> Self {
        Self(value)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FilterId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let v = s
            .parse::<u32>()
            .map_err(|e| format!("invalid filter id string '{}': {}", s, e))?;
        Ok(Self(v))
    }
}

/// Process-unique identity of one physical operator instance.
///
/// Pipeline construction memoizes on this id, so two handles to the same operator
/// always compare equal while two separately lowered operators never do.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct OperatorId(u32);

impl OperatorId {
    pub fn next() -> Self {
        Self(NEXT_OPERATOR_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a pipeline inside one pipeline graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct PipelineId(pub usize);

impl fmt::Display for PipelineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::{FilterId, OperatorId};

    #[test]
    fn operator_ids_are_unique() {
        let a = OperatorId::next();
        let b = OperatorId::next();
        assert_ne!(a, b);
    }

    #[test]
    fn filter_id_parses() {
        assert_eq!("7".parse::<FilterId>().unwrap(), FilterId::new(7));
        assert!("x".parse::<FilterId>().is_err());
    }
}

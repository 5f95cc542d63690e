/*
 * Copyright (c) 2024 Yunshan Networks
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use std::cmp::Ordering;

use crate::common::{FlowKey, RankedFlow};

// heavier flows first, equal volumes ordered by key
fn rank(a: &RankedFlow, b: &RankedFlow) -> Ordering {
    b.bytes.cmp(&a.bytes).then_with(|| a.key.cmp(&b.key))
}

/// Returns the `n` heaviest flows of `flows`, bytes descending and ties broken by ascending
/// [`FlowKey`] order.
///
/// Only the `n` winners are fully sorted, the rest is partitioned away first. Because `rank`
/// is a total order the result is the same as sorting everything and truncating.
pub fn extract<I>(flows: I, n: usize) -> Vec<RankedFlow>
where
    I: IntoIterator<Item = (FlowKey, u64)>,
{
    if n == 0 {
        return vec![];
    }
    let mut ranked: Vec<RankedFlow> = flows
        .into_iter()
        .map(|(key, bytes)| RankedFlow { key, bytes })
        .collect();
    if ranked.len() > n {
        ranked.select_nth_unstable_by(n - 1, rank);
        ranked.truncate(n);
    }
    ranked.sort_unstable_by(rank);
    ranked
}

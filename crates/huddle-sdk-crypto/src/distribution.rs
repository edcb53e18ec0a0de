// Copyright 2024 The Huddle Project
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! The background task that periodically offers our group keys to
//! participants still waiting for them.

use std::sync::{Arc, Weak};

use tokio::{
    task::JoinHandle,
    time::{self, MissedTickBehavior},
};
use tracing::trace;

use crate::machine::{E2eeMachine, MachineInner};

/// Handle owning the key distribution loop.
///
/// Dropping the handle aborts the task. The loop itself only holds a
/// weak reference to the machine, so an [`E2eeMachine`] that is dropped
/// without an explicit stop does not get kept alive by its own
/// background work.
#[derive(Debug)]
pub(crate) struct DistributionTask {
    handle: JoinHandle<()>,
}

impl DistributionTask {
    /// Spawn the distribution loop for the given machine.
    ///
    /// The first tick fires right away, later ticks follow the
    /// configured interval. Ticks run to completion before the next one
    /// is scheduled, so they never overlap.
    pub(crate) fn spawn(machine: &E2eeMachine) -> Self {
        let period = machine.config().distribution_interval;
        let weak: Weak<MachineInner> = Arc::downgrade(&machine.inner);

        let handle = tokio::spawn(async move {
            let mut interval = time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                interval.tick().await;

                let Some(inner) = weak.upgrade() else {
                    trace!("The machine is gone, stopping the key distribution loop");
                    break;
                };

                E2eeMachine { inner }.distribution_tick().await;
            }
        });

        Self { handle }
    }
}

impl Drop for DistributionTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

use fleet_server::{
    id::OwnerId,
    instance::{ServerInfo, ServerInstance},
};

use crate::error::FleetError;

/// The servers currently held by one owner, in server order.
pub struct OwnerSession {
    owner: OwnerId,
    instances: Vec<ServerInstance>,
}

impl OwnerSession {
    pub fn new(owner: OwnerId) -> Self {
        Self {
            owner,
            instances: vec![],
        }
    }

    pub fn owner(&self) -> &OwnerId {
        &self.owner
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[ServerInstance] {
        &self.instances
    }

    pub fn instances_mut(&mut self) -> &mut [ServerInstance] {
        &mut self.instances
    }

    pub fn get_mut(&mut self, index: usize) -> Result<&mut ServerInstance, FleetError> {
        let owner = &self.owner;
        self.instances
            .get_mut(index)
            .ok_or_else(|| FleetError::UnknownServer {
                owner: owner.clone(),
                index,
            })
    }

    /// Two distinct servers, mutably.
    pub fn pair_mut(
        &mut self,
        first: usize,
        second: usize,
    ) -> Result<(&mut ServerInstance, &mut ServerInstance), FleetError> {
        if first == second {
            return Err(FleetError::SelfReplication { index: first });
        }
        let len = self.instances.len();
        for index in [first, second] {
            if index >= len {
                return Err(FleetError::UnknownServer {
                    owner: self.owner.clone(),
                    index,
                });
            }
        }

        if first < second {
            let (head, tail) = self.instances.split_at_mut(second);
            Ok((&mut head[first], &mut tail[0]))
        } else {
            let (head, tail) = self.instances.split_at_mut(first);
            Ok((&mut tail[0], &mut head[second]))
        }
    }

    pub(crate) fn push(&mut self, instance: ServerInstance) {
        self.instances.push(instance);
    }

    /// Instances past the first `keep`, which a shrink retires.
    pub(crate) fn tail_mut(&mut self, keep: usize) -> &mut [ServerInstance] {
        let keep = keep.min(self.instances.len());
        &mut self.instances[keep..]
    }

    /// Forgets every instance past the first `keep`. They must already be destroyed.
    pub(crate) fn truncate(&mut self, keep: usize) {
        self.instances.truncate(keep);
    }

    pub fn infos(&self) -> Vec<ServerInfo> {
        self.instances.iter().map(ServerInstance::info).collect()
    }
}

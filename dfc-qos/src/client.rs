use dfc_common::constants::MAX_CLIENT_NUM;
use dfc_transport::ModemTransport;
use parking_lot::Mutex;
use tracing::debug;

/// Maps a client instance to its slot: instance 0 owns slot 0, every other instance slot 1.
pub fn slot_for(instance: u32) -> usize {
    if instance == 0 {
        0
    } else {
        1
    }
}

#[derive(Debug, Clone, Copy)]
struct GrantClient {
    instance: u32,
    exiting: bool,
}

#[derive(Debug, Default)]
struct Clients {
    grant: [Option<GrantClient>; MAX_CLIENT_NUM],
    /// The power-save client always lives on slot 0.
    powersave: bool,
}

/// The modem clients registered on a port.
#[derive(Debug, Default)]
pub struct ClientRegistry {
    inner: Mutex<Clients>,
}

impl ClientRegistry {
    /// Creates a registry with no clients.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the grant client of `instance`. Returns `false` if its slot is taken.
    pub fn register_grant(&self, instance: u32) -> bool {
        let slot = slot_for(instance);
        let mut clients = self.inner.lock();
        if clients.grant[slot].is_some() {
            return false;
        }

        clients.grant[slot] = Some(GrantClient { instance, exiting: false });
        debug!(instance, slot, "registered grant client");
        true
    }

    /// Returns `true` if the slot of `instance` holds a grant client.
    pub fn has_grant_client(&self, instance: u32) -> bool {
        self.inner.lock().grant[slot_for(instance)].is_some()
    }

    /// Returns `true` if any slot holds a grant client.
    pub fn any_grant_client(&self) -> bool {
        self.inner.lock().grant.iter().any(Option::is_some)
    }

    /// Flags the slot of `instance` as going away. Exiting clients are never queried.
    pub fn mark_exiting(&self, instance: u32) {
        if let Some(client) = self.inner.lock().grant[slot_for(instance)].as_mut() {
            client.exiting = true;
        }
    }

    /// Drops the grant client in the slot of `instance`. Returns `false` if there was none.
    pub fn remove_grant(&self, instance: u32) -> bool {
        let slot = slot_for(instance);
        let removed = self.inner.lock().grant[slot].take();
        if let Some(client) = removed {
            debug!(instance = client.instance, slot, "removed grant client");
        }
        removed.is_some()
    }

    /// Registers the power-save client. Returns `false` if it already was.
    pub fn register_powersave(&self) -> bool {
        !std::mem::replace(&mut self.inner.lock().powersave, true)
    }

    /// Drops the power-save client. Returns `false` if there was none.
    pub fn remove_powersave(&self) -> bool {
        std::mem::replace(&mut self.inner.lock().powersave, false)
    }

    /// Returns `true` if the power-save client is registered.
    pub fn has_powersave_client(&self) -> bool {
        self.inner.lock().powersave
    }

    /// Asks every grant client that is not exiting for a fresh grant report.
    pub fn query_grants(&self, modem: &dyn ModemTransport) {
        let slots: Vec<usize> = {
            let clients = self.inner.lock();
            clients
                .grant
                .iter()
                .enumerate()
                .filter(|(_, client)| client.map_or(false, |c| !c.exiting))
                .map(|(slot, _)| slot)
                .collect()
        };

        for slot in slots {
            modem.query_grants(slot);
        }
    }

    /// Drops every client.
    pub fn clear(&self) {
        *self.inner.lock() = Clients::default();
    }
}

use std::sync::Arc;

use dfc_common::{AddressFamily, Scheduler};
use dfc_transport::{ModemTransport, TxQueues};
use dfc_wire::Packet;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use tracing::{debug, warn};

use crate::{
    client::{slot_for, ClientRegistry},
    config::{ModeFlags, PowerSaveOptions, QosOptions, Tunables},
    context::{GrantUpdate, QosContext},
    filter::FilterSpec,
    powersave::{FlowGate, ListenerId, Listeners, PowerSave, PowerSaveListener},
    QosError,
};

/// A control command, as delivered by the link configuration channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    ActivateFlow { bearer_id: u8, flow_id: u32, family: AddressFamily, queue_index: u16 },
    DeactivateFlow { bearer_id: u8, flow_id: u32, family: AddressFamily },
    ConfigureClient { instance: u32, flags: ModeFlags },
    DeleteClient { instance: u32 },
    /// Sets the grant threshold divisor. Zero is ignored.
    SetScaleFactor(u32),
    SetPollFrequency(u32),
    AddFilter { flow_id: u32, family: AddressFamily, spec: FilterSpec },
    RemoveFilter { flow_id: u32, family: AddressFamily },
}

/// The interfaces of a port, keyed by mux id.
#[derive(Default)]
struct Contexts {
    map: RwLock<FxHashMap<u8, Arc<QosContext>>>,
}

impl Contexts {
    fn snapshot(&self) -> Vec<Arc<QosContext>> {
        self.map.read().values().cloned().collect()
    }
}

impl FlowGate for Contexts {
    fn all_flows_enabled(&self) -> bool {
        self.snapshot().iter().all(|ctx| ctx.all_flows_enabled())
    }

    fn enable_all_flows(&self) {
        for ctx in self.snapshot() {
            ctx.enable_all_flows();
        }
    }
}

/// Flow control for one physical port: its interfaces, modem clients and power-save.
pub struct Engine {
    tunables: Arc<Tunables>,
    options: QosOptions,
    powersave_options: PowerSaveOptions,
    modem: Arc<dyn ModemTransport>,
    scheduler: Arc<dyn Scheduler>,
    contexts: Arc<Contexts>,
    clients: Arc<ClientRegistry>,
    listeners: Arc<Listeners>,
    powersave: Mutex<Option<PowerSave>>,
}

impl Engine {
    /// Creates an engine with default options.
    pub fn new(modem: Arc<dyn ModemTransport>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self::with_options(modem, scheduler, QosOptions::default(), PowerSaveOptions::default())
    }

    /// Creates an engine with the given context and power-save options.
    pub fn with_options(
        modem: Arc<dyn ModemTransport>,
        scheduler: Arc<dyn Scheduler>,
        options: QosOptions,
        powersave_options: PowerSaveOptions,
    ) -> Self {
        Self {
            tunables: Arc::new(Tunables::new()),
            options,
            powersave_options,
            modem,
            scheduler,
            contexts: Arc::new(Contexts::default()),
            clients: Arc::new(ClientRegistry::new()),
            listeners: Arc::new(Listeners::new()),
            powersave: Mutex::new(None),
        }
    }

    /// The port-wide knobs shared by every context.
    pub fn tunables(&self) -> &Arc<Tunables> {
        &self.tunables
    }

    /// The modem clients registered on the port.
    pub fn clients(&self) -> &ClientRegistry {
        &self.clients
    }

    /// Creates the context of interface `mux_id`, or returns the existing one.
    pub fn add_context(&self, mux_id: u8, queues: Arc<dyn TxQueues>) -> Arc<QosContext> {
        let mut map = self.contexts.map.write();
        Arc::clone(map.entry(mux_id).or_insert_with(|| {
            debug!(mux_id, "created context");
            QosContext::new(
                mux_id,
                queues,
                Arc::clone(&self.scheduler),
                Arc::clone(&self.tunables),
                self.options.clone(),
            )
        }))
    }

    /// The context of interface `mux_id`, if it exists.
    pub fn context(&self, mux_id: u8) -> Option<Arc<QosContext>> {
        self.contexts.map.read().get(&mux_id).cloned()
    }

    /// Tears down interface `mux_id`. Returns `false` if it did not exist.
    pub fn remove_context(&self, mux_id: u8) -> bool {
        let removed = self.contexts.map.write().remove(&mux_id);
        match removed {
            Some(ctx) => {
                ctx.shutdown();
                true
            }
            None => false,
        }
    }

    fn require_context(&self, mux_id: u8) -> Result<Arc<QosContext>, QosError> {
        self.context(mux_id).ok_or(QosError::NoContext(mux_id))
    }

    /// Applies a control command. Flow and filter commands address interface `mux_id`.
    pub fn change_link(&self, mux_id: u8, command: Command) -> Result<(), QosError> {
        match command {
            Command::ActivateFlow { bearer_id, flow_id, family, queue_index } => {
                if self.tunables.mode().is_none() || !self.clients.any_grant_client() {
                    debug!(mux_id, flow_id, "no grant client, ignoring flow activation");
                    return Ok(());
                }
                self.require_context(mux_id)?.add_flow(bearer_id, flow_id, family, queue_index)
            }
            Command::DeactivateFlow { bearer_id, flow_id, family } => {
                if self.tunables.mode().is_none() {
                    return Ok(());
                }
                self.require_context(mux_id)?.del_flow(bearer_id, flow_id, family);
                Ok(())
            }
            Command::ConfigureClient { instance, flags } => {
                self.configure_client(instance, flags);
                Ok(())
            }
            Command::DeleteClient { instance } => {
                self.delete_client(instance);
                Ok(())
            }
            Command::SetScaleFactor(factor) => {
                self.tunables.set_scale_factor(factor);
                Ok(())
            }
            Command::SetPollFrequency(frequency) => {
                self.tunables.set_poll_frequency(frequency);
                Ok(())
            }
            Command::AddFilter { flow_id, family, spec } => {
                self.require_context(mux_id)?.add_filter(flow_id, family, &spec)
            }
            Command::RemoveFilter { flow_id, family } => {
                self.require_context(mux_id)?.remove_filter(flow_id, family);
                Ok(())
            }
        }
    }

    /// Records the mode flags and registers the clients they ask for.
    pub fn configure_client(&self, instance: u32, flags: ModeFlags) {
        self.tunables.apply_flags(flags);

        if flags.mode().is_none() && !flags.powersave() {
            warn!(instance, flags = flags.0, "unsupported client mode");
            return;
        }

        if flags.mode().is_some() && !self.clients.register_grant(instance) {
            debug!(instance, "grant client already registered");
        }

        if !flags.powersave() {
            return;
        }

        if slot_for(instance) == 0 {
            self.clients.register_powersave();
        }

        let mut powersave = self.powersave.lock();
        if powersave.is_none() {
            *powersave = Some(PowerSave::start(
                self.powersave_options.clone(),
                Arc::clone(&self.tunables),
                Arc::clone(&self.modem),
                self.contexts.clone(),
                Arc::clone(&self.clients),
                Arc::clone(&self.listeners),
                Arc::clone(&self.scheduler),
            ));
        }
    }

    /// Drops the clients of `instance`. Instance 0 also stops power-save.
    pub fn delete_client(&self, instance: u32) {
        if slot_for(instance) == 0 {
            let powersave = self.powersave.lock().take();
            if let Some(powersave) = powersave {
                powersave.stop();
            }
            self.clients.remove_powersave();
        } else {
            self.clients.mark_exiting(instance);
            if let Some(powersave) = self.powersave() {
                powersave.flush();
            }
        }

        self.clients.remove_grant(instance);
    }

    /// The running power-save controller, if any.
    pub fn powersave(&self) -> Option<PowerSave> {
        self.powersave.lock().clone()
    }

    /// Registers a listener for power-save transitions.
    pub fn register_powersave_listener(&self, listener: Arc<dyn PowerSaveListener>) -> ListenerId {
        self.listeners.register(listener)
    }

    /// Returns `false` if `id` was not registered.
    pub fn deregister_powersave_listener(&self, id: ListenerId) -> bool {
        self.listeners.deregister(id)
    }

    /// Applies a modem grant to a bearer of interface `mux_id`, unless power-save currently
    /// drops grants. Returns whether the grant was applied.
    pub fn update_grant(&self, mux_id: u8, update: GrantUpdate) -> Result<bool, QosError> {
        if self.powersave().map_or(false, |ps| ps.ignore_grant()) {
            debug!(mux_id, bearer_id = update.bearer_id, "ignoring grant in powersave");
            return Ok(false);
        }
        Ok(self.require_context(mux_id)?.update_grant(update))
    }

    /// Records downlink activity for the power-save poll.
    pub fn set_dl_msg_active(&self) {
        if let Some(powersave) = self.powersave() {
            powersave.set_dl_msg_active();
        }
    }

    /// Marks the packet and picks its transmit queue. Returns `None` for unknown interfaces.
    pub fn classify(&self, mux_id: u8, packet: &mut Packet) -> Option<u16> {
        let ctx = self.context(mux_id)?;
        ctx.mark_packet(packet);
        Some(ctx.select_queue(packet))
    }

    /// Accounts a transmitted packet against its bearer's grant and wakes the power-save poll.
    pub fn on_transmit(&self, mux_id: u8, packet: &Packet) {
        if let Some(ctx) = self.context(mux_id) {
            let len = u32::try_from(packet.len()).unwrap_or(u32::MAX);
            ctx.burst_check(packet.family(), packet.mark(), len);
        }

        if let Some(powersave) = self.powersave() {
            powersave.maybe_restart();
        }
    }

    /// Stops power-save, drops every client and tears down every interface.
    pub fn shutdown(&self) {
        let powersave = self.powersave.lock().take();
        if let Some(powersave) = powersave {
            powersave.stop();
        }
        self.clients.clear();

        let contexts: Vec<_> = self.contexts.map.write().drain().map(|(_, ctx)| ctx).collect();
        for ctx in contexts {
            ctx.shutdown();
        }
        debug!("engine shut down");
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("tunables", &self.tunables)
            .field("options", &self.options)
            .field("contexts", &self.contexts.map.read().len())
            .field("clients", &self.clients)
            .field("powersave", &self.powersave)
            .finish_non_exhaustive()
    }
}

use crate::model::{DeltaRecord, Event, Lifecycle, Structure};

/// Translates a control-plane event into model changes.
///
/// A mapper may fill in a missing event summary; it never fails. Events it
/// does not understand yield no records.
pub trait EventMapper: Send + Sync {
    fn map(&self, event: &mut Event) -> Vec<DeltaRecord>;
}

/// Trait name → record fields it populates.
const INSTANCE_TRAITS: &[(&str, &[&str])] = &[
    ("display_name", &["title", "hostName"]),
    ("instance_id", &["resourceId", "serverId"]),
    ("state", &["serverStatus"]),
    ("flavor_name", &["set_flavor_name"]),
    ("host_name", &["set_host_name"]),
    ("image_name", &["set_image_name"]),
    ("tenant_id", &["set_tenant"]),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    /// Only identifies the component.
    Identify,
    /// Sets a summary, no model change.
    Summary(&'static str),
    Create(&'static str),
    Update(&'static str),
    /// Update whose summary carries the status transition.
    StatusUpdate(&'static str),
    Delete(&'static str),
}

const INSTANCE_EVENTS: &[(&str, Action)] = &[
    ("compute.instance.create.start", Action::Create("created")),
    ("compute.instance.create.end", Action::Update("updated")),
    ("compute.instance.create.error", Action::Update("updated")),
    ("compute.instance.update", Action::StatusUpdate("updated")),
    ("compute.instance.delete.start", Action::Identify),
    ("compute.instance.delete.end", Action::Delete("deleted")),
    ("compute.instance.create_ip.start", Action::Identify),
    ("compute.instance.create_ip.end", Action::Identify),
    ("compute.instance.delete_ip.start", Action::Identify),
    ("compute.instance.delete_ip.end", Action::Identify),
    ("compute.instance.exists", Action::Identify),
    ("compute.instance.exists.verified.old", Action::Identify),
    ("compute.instance.live_migration.pre.start", Action::Identify),
    ("compute.instance.live_migration.pre.end", Action::Identify),
    ("compute.instance.live_migration.post.dest.start", Action::Identify),
    ("compute.instance.live_migration.post.dest.end", Action::Identify),
    ("compute.instance.live_migration._post.start", Action::Identify),
    ("compute.instance.live_migration._post.end", Action::Update("updated")),
    ("compute.instance.power_off.start", Action::Summary("powering off")),
    ("compute.instance.power_off.end", Action::StatusUpdate("powered off")),
    ("compute.instance.power_on.start", Action::Summary("powering on")),
    ("compute.instance.power_on.end", Action::StatusUpdate("powered on")),
    ("compute.instance.reboot.start", Action::StatusUpdate("rebooting")),
    ("compute.instance.reboot.end", Action::StatusUpdate("rebooted")),
    ("compute.instance.shutdown.start", Action::StatusUpdate("shutting down")),
    ("compute.instance.shutdown.end", Action::StatusUpdate("shut down")),
    ("compute.instance.rebuild.start", Action::StatusUpdate("rebuilding")),
    ("compute.instance.rebuild.end", Action::StatusUpdate("rebuilt")),
    ("compute.instance.rescue.start", Action::Identify),
    ("compute.instance.rescue.end", Action::Update("placed in rescue mode")),
    ("compute.instance.unrescue.start", Action::Identify),
    ("compute.instance.unrescue.end", Action::Update("removed from rescue mode")),
    ("compute.instance.finish_resize.start", Action::Identify),
    ("compute.instance.finish_resize.end", Action::Update("updated")),
    ("compute.instance.resize.start", Action::Identify),
    ("compute.instance.resize.confirm.start", Action::Identify),
    ("compute.instance.resize.confirm.end", Action::Identify),
    ("compute.instance.resize.prep.start", Action::Identify),
    ("compute.instance.resize.prep.end", Action::Identify),
    ("compute.instance.resize.revert.start", Action::Identify),
    ("compute.instance.resize.revert.end", Action::Update("updated")),
    ("compute.instance.resize.end", Action::Update("updated")),
    ("compute.instance.snapshot.start", Action::Identify),
    ("compute.instance.snapshot.end", Action::Identify),
    ("compute.instance.suspend", Action::Update("suspended")),
    ("compute.instance.resume", Action::Update("resumed")),
    ("compute.instance.volume.attach", Action::Identify),
    ("compute.instance.volume.detach", Action::Identify),
];

/// Maps compute-instance lifecycle events to `Instance` records.
#[derive(Debug, Default, Clone, Copy)]
pub struct InstanceEventMapper;

impl InstanceEventMapper {
    pub fn new() -> Self {
        Self
    }

    /// Whether `event_type` is one of the instance events this mapper knows.
    pub fn knows(event_type: &str) -> bool {
        lookup(event_type).is_some()
    }

    fn record(event: &Event, instance_id: &str) -> DeltaRecord {
        let mut record = DeltaRecord::new(
            instance_target_id(instance_id),
            Structure::new("Instance", "", "components"),
        );
        for (trait_name, fields) in INSTANCE_TRAITS {
            let Some(value) = event.traits.get(*trait_name) else {
                continue;
            };
            if value.is_null() {
                continue;
            }
            for field in *fields {
                record.set_field(*field, value.clone());
            }
        }
        record
    }
}

impl EventMapper for InstanceEventMapper {
    fn map(&self, event: &mut Event) -> Vec<DeltaRecord> {
        let Some(action) = lookup(&event.event_type) else {
            return Vec::new();
        };
        let Some(instance_id) = event.trait_str("instance_id") else {
            tracing::debug!(
                event_type = %event.event_type,
                "instance event without instance_id trait",
            );
            return Vec::new();
        };

        event.component = instance_target_id(&instance_id);
        let name = event
            .trait_str("display_name")
            .unwrap_or_else(|| instance_id.clone());

        let (verb, status) = match action {
            Action::Identify => return Vec::new(),
            Action::Summary(verb) => {
                set_summary(event, format!("Instance {name} {verb}"));
                return Vec::new();
            }
            Action::Create(verb) | Action::Update(verb) | Action::Delete(verb) => (verb, false),
            Action::StatusUpdate(verb) => (verb, true),
        };

        let mut summary = format!("Instance {name} {verb}");
        if status {
            summary.push_str(&status_change(event));
        }
        set_summary(event, summary);

        let record = match action {
            Action::Create(_) => {
                Self::record(event, &instance_id).with_lifecycle(Lifecycle::Create)
            }
            Action::Delete(_) => DeltaRecord::delete(
                instance_target_id(&instance_id),
                Structure::new("Instance", "", "components"),
            ),
            _ => Self::record(event, &instance_id),
        };
        vec![record]
    }
}

fn lookup(event_type: &str) -> Option<Action> {
    INSTANCE_EVENTS
        .iter()
        .find(|(name, _)| *name == event_type)
        .map(|(_, action)| *action)
}

/// Modeled id of the instance with the given control-plane id.
pub fn instance_target_id(instance_id: &str) -> String {
    format!("server-{instance_id}")
}

fn set_summary(event: &mut Event, summary: String) {
    if event.summary.is_empty() {
        event.summary = summary;
    }
}

/// ` (status changed from X to Y [descr])`, or empty when no state trait.
fn status_change(event: &Event) -> String {
    let descr = event
        .trait_str("state_description")
        .filter(|d| !d.is_empty())
        .map(|d| format!(" [{d}]"))
        .unwrap_or_default();
    let state = event.trait_str("state");

    match (event.trait_str("old_state"), state) {
        (Some(old), Some(new)) => format!(" (status changed from {old} to {new}{descr})"),
        (None, Some(new)) => format!(" (status changed to {new}{descr})"),
        _ => String::new(),
    }
}

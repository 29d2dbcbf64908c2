//! In-place vs dispatched execution.

use crate::communicator::CommunicationTraits;
use crate::settings::MethodCommunicationSettings;
use crate::types::ServiceCategory;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Execute in this process. With `lease`, the call is first published as
    /// a locked message and the lock is completed or released afterwards.
    InPlace { lease: bool },
    /// Dispatch and block for the reply.
    DispatchSync,
    /// Dispatch and report "scheduled".
    DispatchScheduled,
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InPlace { lease: false } => "in_place",
            Self::InPlace { lease: true } => "in_place_leased",
            Self::DispatchSync => "dispatch_sync",
            Self::DispatchScheduled => "dispatch_scheduled",
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct RunModeInput<'a> {
    pub settings: &'a MethodCommunicationSettings,
    pub category: ServiceCategory,
    /// A routine for the target is registered in this process.
    pub hosted_locally: bool,
    pub traits: CommunicationTraits,
    /// The caller would rather block than poll.
    pub prefer_sync: bool,
}

pub fn decide_run_mode(input: RunModeInput<'_>) -> RunMode {
    let settings = input.settings;
    let in_place = settings.run_in_place
        && input.category == ServiceCategory::Local
        && input.hosted_locally
        && (!settings.persistent
            || input
                .traits
                .contains(CommunicationTraits::MESSAGE_LOCK_ON_PUBLISH));

    if in_place {
        return RunMode::InPlace {
            lease: settings.persistent,
        };
    }
    if input.prefer_sync && input.traits.contains(CommunicationTraits::SYNC_REPLIES) {
        RunMode::DispatchSync
    } else {
        RunMode::DispatchScheduled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(
        settings: &MethodCommunicationSettings,
        category: ServiceCategory,
        traits: CommunicationTraits,
    ) -> RunModeInput<'_> {
        RunModeInput {
            settings,
            category,
            hosted_locally: true,
            traits,
            prefer_sync: true,
        }
    }

    #[test]
    fn local_query_runs_in_place_without_lease() {
        let s = MethodCommunicationSettings::query_defaults();
        let mode = decide_run_mode(input(&s, ServiceCategory::Local, CommunicationTraits::empty()));
        assert_eq!(mode, RunMode::InPlace { lease: false });
    }

    #[test]
    fn persistent_in_place_needs_message_lock() {
        let s = MethodCommunicationSettings {
            run_in_place: true,
            ..MethodCommunicationSettings::command_defaults()
        };
        let without = decide_run_mode(input(&s, ServiceCategory::Local, CommunicationTraits::empty()));
        assert_eq!(without, RunMode::DispatchScheduled);

        let with = decide_run_mode(input(
            &s,
            ServiceCategory::Local,
            CommunicationTraits::MESSAGE_LOCK_ON_PUBLISH,
        ));
        assert_eq!(with, RunMode::InPlace { lease: true });
    }

    #[test]
    fn external_persistent_command_never_runs_in_place() {
        let s = MethodCommunicationSettings {
            run_in_place: true,
            ..MethodCommunicationSettings::command_defaults()
        };
        let all = CommunicationTraits::MESSAGE_LOCK_ON_PUBLISH | CommunicationTraits::SYNC_REPLIES;
        let mode = decide_run_mode(input(&s, ServiceCategory::External, all));
        assert_eq!(mode, RunMode::DispatchSync);
    }

    #[test]
    fn unhosted_local_target_is_dispatched() {
        let s = MethodCommunicationSettings::query_defaults();
        let mut i = input(&s, ServiceCategory::Local, CommunicationTraits::empty());
        i.hosted_locally = false;
        assert_eq!(decide_run_mode(i), RunMode::DispatchScheduled);
    }

    #[test]
    fn sync_dispatch_requires_sync_replies() {
        let s = MethodCommunicationSettings::command_defaults();
        let mut i = input(&s, ServiceCategory::Local, CommunicationTraits::SYNC_REPLIES);
        assert_eq!(decide_run_mode(i), RunMode::DispatchSync);
        i.prefer_sync = false;
        assert_eq!(decide_run_mode(i), RunMode::DispatchScheduled);
    }
}

use crate::status::UpsState;

/// Decides whether moving from `previous` to `current` is a real power event.
///
/// Only a flip between online and on-battery counts. The very first
/// observation never fires, and neither does anything going into or out of
/// the unknown state, which just means the ups could not be read.
pub fn should_fire(previous: Option<&UpsState>, current: &UpsState) -> bool {
    match previous {
        Some(previous) => {
            !previous.is_unknown() && !current.is_unknown() && previous.status != current.status
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::UpsStatus::{self, OnBattery, Online, Unknown};
    use rstest::rstest;

    fn state(status: UpsStatus) -> UpsState {
        UpsState::new(status, 50, 600)
    }

    #[rstest]
    #[case(Online)]
    #[case(OnBattery)]
    #[case(Unknown)]
    fn first_observation_never_fires(#[case] current: UpsStatus) {
        assert!(!should_fire(None, &state(current)));
    }

    #[rstest]
    #[case(Online, OnBattery, true)]
    #[case(OnBattery, Online, true)]
    #[case(Online, Online, false)]
    #[case(OnBattery, OnBattery, false)]
    #[case(Unknown, Online, false)]
    #[case(Unknown, OnBattery, false)]
    #[case(Online, Unknown, false)]
    #[case(OnBattery, Unknown, false)]
    #[case(Unknown, Unknown, false)]
    fn fires_only_on_real_flips(
        #[case] previous: UpsStatus,
        #[case] current: UpsStatus,
        #[case] fires: bool,
    ) {
        assert_eq!(should_fire(Some(&state(previous)), &state(current)), fires);
    }

    #[test]
    fn readings_alone_do_not_fire() {
        let before = UpsState::new(Online, 100, 3600);
        let after = UpsState::new(Online, 40, 200);
        assert!(!should_fire(Some(&before), &after));
    }
}

//! Driver initialization failure
//!
//! Lives in its own test binary: initialization is process-wide and every
//! other suite initializes the host driver on first use.

use segdrv::driver::{Device, Driver};
use segdrv::error::Error;
use segdrv::runtime::Status;
use segdrv::runtime::host::HostBackend;

#[test]
fn test_init_failure_is_reported_and_recoverable() {
    HostBackend::inject_init_error(Some(Status::NO_DEVICE));

    let err = Driver::<HostBackend>::init().unwrap_err();
    assert!(matches!(
        err,
        Error::Initialization {
            status: Status::NO_DEVICE,
            ..
        }
    ));
    assert!(err.is_fatal());

    // Nothing else works until init succeeds.
    let err = Driver::<HostBackend>::device_count().unwrap_err();
    assert_eq!(err.status(), Some(Status::NOT_INITIALIZED));
    assert!(Device::<HostBackend>::get(0).is_err());

    HostBackend::inject_init_error(None);
    Driver::<HostBackend>::init().unwrap();
    assert_eq!(Driver::<HostBackend>::device_count().unwrap(), 2);

    // Once initialized, later injections are ignored.
    HostBackend::inject_init_error(Some(Status::NO_DEVICE));
    Driver::<HostBackend>::init().unwrap();
    HostBackend::inject_init_error(None);
}

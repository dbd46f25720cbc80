// gb-test-utils: Shared test utilities for the gridbus suite.
//
// Provides a framed RPC client and a mock beanstalkd broker for
// integration testing of the server and event-queue crates.

pub mod frame_client;
pub mod mock_beanstalkd;

pub use frame_client::FrameClient;
pub use mock_beanstalkd::MockBeanstalkd;

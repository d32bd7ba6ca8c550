//! Mock transport for deterministic testing of the bus engine.
//!
//! [`MockTransport`] implements the [`Transport`] trait with pre-loaded
//! request/response pairs. This lets you test packet encoding, bulk
//! transaction framing, and status-packet parsing without real motors.
//!
//! The mock is cheaply cloneable and every clone shares the same state, so
//! a test can keep one clone for inspection after moving the other into a
//! bus channel.
//!
//! # Example
//!
//! ```
//! use dxlbus_test_harness::MockTransport;
//!
//! let mock = MockTransport::new();
//! // Ping motor 1; motor 1 answers with model 1030, firmware 0x26.
//! mock.expect(
//!     &[0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x03, 0x00, 0x01, 0x19, 0x4E],
//!     &[0xFF, 0xFF, 0xFD, 0x00, 0x01, 0x07, 0x00, 0x55, 0x00, 0x06, 0x04, 0x26, 0x65, 0x5D],
//! );
//! ```

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use dxlbus_core::error::{CommError, Error, Result};
use dxlbus_core::transport::Transport;

/// A pre-loaded request/response pair for the mock transport.
#[derive(Debug, Clone)]
struct Expectation {
    /// The exact bytes we expect to be sent.
    request: Vec<u8>,
    /// The bytes to return once the matching request is sent. May be empty
    /// for frames that solicit no reply.
    response: Vec<u8>,
}

#[derive(Debug, Default)]
struct MockState {
    expectations: VecDeque<Expectation>,
    /// Bytes waiting to be received, like a port's input buffer.
    rx: VecDeque<u8>,
    /// Whether `receive()` sleeps out its timeout on an empty buffer.
    wait_on_silence: bool,
    connected: bool,
    open_error: Option<CommError>,
    opened: Vec<(String, u32)>,
    sent_log: Vec<Vec<u8>>,
}

/// A mock [`Transport`] for testing without hardware.
///
/// Expectations are consumed in order. When `send()` is called, the sent
/// data is recorded and matched against the next expectation. The
/// corresponding response is appended to the receive buffer and handed out
/// by subsequent `receive()` calls. Bytes nobody reads stay buffered across
/// exchanges. An empty buffer makes `receive()` report
/// [`CommError::NoResponse`], just as a silent bus would.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a new mock transport in the closed state.
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A poisoned lock only happens after a panicking test; keep going
        // so the original panic is the one reported.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Add an expected request/response pair.
    pub fn expect(&self, request: &[u8], response: &[u8]) {
        self.state().expectations.push_back(Expectation {
            request: request.to_vec(),
            response: response.to_vec(),
        });
    }

    /// Make the next `open()` call fail with `error`.
    pub fn fail_open(&self, error: CommError) {
        self.state().open_error = Some(error);
    }

    /// Every `(port, baud)` pair passed to a successful `open()`.
    pub fn opened(&self) -> Vec<(String, u32)> {
        self.state().opened.clone()
    }

    /// All data that has been sent through this transport, one element
    /// per `send()` call.
    pub fn sent_data(&self) -> Vec<Vec<u8>> {
        self.state().sent_log.clone()
    }

    /// Return the number of expectations that have not yet been consumed.
    pub fn remaining_expectations(&self) -> usize {
        self.state().expectations.len()
    }

    /// Put bytes on the receive side without a request, as a motor that
    /// answers after its exchange has ended would.
    pub fn inject(&self, bytes: &[u8]) {
        self.state().rx.extend(bytes);
    }

    /// Make `receive()` wait out its full timeout before reporting silence,
    /// as a real port does. Off by default so tests run instantly.
    pub fn wait_on_silence(&self, wait: bool) {
        self.state().wait_on_silence = wait;
    }

    /// Force the connected state without going through `open()`.
    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn open(&mut self, port: &str, baud_rate: u32) -> Result<()> {
        let mut state = self.state();
        if let Some(err) = state.open_error.take() {
            return Err(err.into());
        }
        state.connected = true;
        state.opened.push((port.to_string(), baud_rate));
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<()> {
        let mut state = self.state();
        if !state.connected {
            return Err(CommError::PortUnavailable("mock transport closed".into()).into());
        }

        state.sent_log.push(data.to_vec());

        match state.expectations.pop_front() {
            Some(expectation) if data == expectation.request.as_slice() => {
                state.rx.extend(expectation.response);
                Ok(())
            }
            Some(expectation) => Err(Error::Protocol(format!(
                "unexpected send data: expected {:02X?}, got {:02X?}",
                expectation.request, data
            ))),
            None => Err(Error::Protocol(
                "no more expectations in mock transport".into(),
            )),
        }
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Duration) -> Result<usize> {
        let wait = {
            let mut state = self.state();
            if !state.connected {
                return Err(CommError::PortUnavailable("mock transport closed".into()).into());
            }
            if !state.rx.is_empty() {
                let n = state.rx.len().min(buf.len());
                for (slot, byte) in buf.iter_mut().zip(state.rx.drain(..n)) {
                    *slot = byte;
                }
                return Ok(n);
            }
            state.wait_on_silence
        };

        if wait {
            tokio::time::sleep(timeout).await;
        }
        Err(CommError::NoResponse.into())
    }

    async fn close(&mut self) -> Result<()> {
        let mut state = self.state();
        state.connected = false;
        state.rx.clear();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.state().connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_mock() -> MockTransport {
        let mut mock = MockTransport::new();
        mock.open("/dev/mock", 57_600).await.unwrap();
        mock
    }

    #[tokio::test]
    async fn mock_transport_basic_send_receive() {
        let mut mock = open_mock().await;
        let request = &[0x01, 0x02, 0x03];
        let response = &[0xAA, 0xBB];
        mock.expect(request, response);

        mock.send(request).await.unwrap();

        let mut buf = [0u8; 64];
        let n = mock
            .receive(&mut buf, Duration::from_millis(100))
            .await
            .unwrap();
        assert_eq!(&buf[..n], response);
    }

    #[tokio::test]
    async fn mock_transport_clones_share_state() {
        let observer = MockTransport::new();
        let mut mock = observer.clone();
        mock.open("/dev/ttyUSB0", 1_000_000).await.unwrap();
        mock.expect(&[0x01], &[]);
        mock.send(&[0x01]).await.unwrap();

        assert_eq!(observer.sent_data(), vec![vec![0x01]]);
        assert_eq!(observer.opened(), vec![("/dev/ttyUSB0".to_string(), 1_000_000)]);
        assert!(observer.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_wrong_data_errors() {
        let mut mock = open_mock().await;
        mock.expect(&[0x01], &[0xFF]);

        let result = mock.send(&[0x99]).await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_no_expectations_errors() {
        let mut mock = open_mock().await;
        let result = mock.send(&[0x01]).await;
        assert!(matches!(result.unwrap_err(), Error::Protocol(_)));
    }

    #[tokio::test]
    async fn mock_transport_silent_response_is_no_response() {
        let mut mock = open_mock().await;
        mock.expect(&[0x01], &[]);
        mock.send(&[0x01]).await.unwrap();

        let mut buf = [0u8; 8];
        let err = mock
            .receive(&mut buf, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Comm(CommError::NoResponse)));
    }

    #[tokio::test]
    async fn mock_transport_unread_bytes_stay_buffered() {
        let mut mock = open_mock().await;
        mock.expect(&[0x01], &[0xAA]);
        mock.expect(&[0x02], &[0xBB]);
        mock.send(&[0x01]).await.unwrap();
        mock.inject(&[0xCC]);
        mock.send(&[0x02]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = mock.receive(&mut buf, Duration::from_millis(10)).await.unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xCC, 0xBB]);
    }

    #[tokio::test]
    async fn mock_transport_wait_on_silence() {
        let mut mock = open_mock().await;
        mock.wait_on_silence(true);

        let start = tokio::time::Instant::now();
        let mut buf = [0u8; 8];
        let err = mock
            .receive(&mut buf, Duration::from_millis(30))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Comm(CommError::NoResponse)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[tokio::test]
    async fn mock_transport_closed_rejects_io() {
        let mut mock = MockTransport::new();
        assert!(!mock.is_connected());

        let err = mock.send(&[0x01]).await.unwrap_err();
        assert!(matches!(err, Error::Comm(CommError::PortUnavailable(_))));
        assert!(mock.sent_data().is_empty());
    }

    #[tokio::test]
    async fn mock_transport_fail_open() {
        let mut mock = MockTransport::new();
        mock.fail_open(CommError::PortUnavailable("COM9".into()));

        let err = mock.open("COM9", 57_600).await.unwrap_err();
        assert!(matches!(err, Error::Comm(CommError::PortUnavailable(_))));
        assert!(!mock.is_connected());
        assert!(mock.opened().is_empty());

        // The failure is one-shot.
        mock.open("COM9", 57_600).await.unwrap();
        assert!(mock.is_connected());
    }

    #[tokio::test]
    async fn mock_transport_partial_receive() {
        let mut mock = open_mock().await;
        mock.expect(&[0x01], &[0xAA, 0xBB, 0xCC, 0xDD]);
        mock.send(&[0x01]).await.unwrap();

        let mut buf = [0u8; 2];
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], &[0xAA, 0xBB]);
        let n = mock.receive(&mut buf, Duration::from_millis(100)).await.unwrap();
        assert_eq!(&buf[..n], &[0xCC, 0xDD]);
        assert_eq!(mock.remaining_expectations(), 0);
    }
}

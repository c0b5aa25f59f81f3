//! Thin driver-boundary wrapper over a transport session.
//!
//! Device-type drivers live outside this crate; what they all share is here:
//! holding one exclusively-owned session, the universal `*IDN?` handshake,
//! and typed query helpers for the common "ask, parse a number" pattern.

use crate::error::{CommResult, ConnectionError};
use crate::factory::ConnectionFactory;
use crate::transport::Transport;

/// A driver-agnostic instrument handle: one session, domain commands in,
/// parsed responses out.
pub struct GenericInstrument {
    id: String,
    session: Box<dyn Transport>,
}

impl GenericInstrument {
    /// Connect through a factory and wrap the resulting session.
    pub async fn connect(factory: &ConnectionFactory, id: &str) -> CommResult<Self> {
        let session = factory.connect(id).await?;
        Ok(Self {
            id: id.to_string(),
            session,
        })
    }

    /// Wrap an already-open session (used by tests with mocks).
    pub fn from_session(id: impl Into<String>, session: Box<dyn Transport>) -> Self {
        Self {
            id: id.into(),
            session,
        }
    }

    /// Registry identifier this instrument was connected as.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Direct access to the underlying session for driver-specific extras.
    pub fn session_mut(&mut self) -> &mut dyn Transport {
        self.session.as_mut()
    }

    /// Standard IEEE 488.2 identification query.
    pub async fn ident(&mut self) -> CommResult<String> {
        self.session.query("*IDN?").await
    }

    /// Send a command that expects no reply.
    pub async fn write(&mut self, command: &str) -> CommResult<()> {
        self.session.write(command).await
    }

    /// Send a command and return the raw response string.
    pub async fn query(&mut self, command: &str) -> CommResult<String> {
        self.session.query(command).await
    }

    /// Query and parse the response as a float.
    pub async fn query_f64(&mut self, command: &str) -> CommResult<f64> {
        let response = self.session.query(command).await?;
        response.trim().parse().map_err(|_| {
            ConnectionError::Malformed(format!(
                "'{}' replied '{response}' to '{command}', expected a number",
                self.id
            ))
        })
    }

    /// Query and parse the response as an integer. Instruments often return
    /// integers in exponent notation, so parse through f64 first.
    pub async fn query_i64(&mut self, command: &str) -> CommResult<i64> {
        let value = self.query_f64(command).await?;
        Ok(value as i64)
    }

    /// Close the underlying session.
    pub async fn close(&mut self) {
        self.session.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MockTransport;

    #[tokio::test]
    async fn ident_issues_standard_idn_query() {
        let mut mock = MockTransport::new().with_responses(["ANDO,AQ6317B,0,1.00"]);
        let journal = mock.journal();
        mock.open().await.expect("open");

        let mut instrument = GenericInstrument::from_session("OSA2", Box::new(mock));
        let ident = instrument.ident().await.expect("ident");
        assert_eq!(ident, "ANDO,AQ6317B,0,1.00");
        assert!(journal
            .entries()
            .iter()
            .any(|entry| entry == "write:*IDN?\\n"));
    }

    #[tokio::test]
    async fn typed_queries_parse_numbers() {
        let mut mock = MockTransport::new().with_responses(["3.5E-3", "1.0E1"]);
        mock.open().await.expect("open");
        let mut instrument = GenericInstrument::from_session("PM1", Box::new(mock));

        let power = instrument.query_f64("READ?").await.expect("float");
        assert!((power - 3.5e-3).abs() < f64::EPSILON);

        let count = instrument.query_i64("COUNT?").await.expect("int");
        assert_eq!(count, 10);
    }

    #[tokio::test]
    async fn unparsable_number_is_malformed() {
        let mut mock = MockTransport::new().with_responses(["NOT A NUMBER"]);
        mock.open().await.expect("open");
        let mut instrument = GenericInstrument::from_session("PM1", Box::new(mock));
        assert!(matches!(
            instrument.query_f64("READ?").await,
            Err(ConnectionError::Malformed(_))
        ));
    }
}

//! Postgres startup phase.
use crate::{
    Result,
    connection::Config,
    postgres::{BackendMessage, ProtocolError, backend, frontend},
    sasl::{SCRAM_SHA_256, Scram, md5_password},
    transport::{PgTransport, PgTransportExt},
};

/// Startup phase successful response.
#[derive(Debug)]
pub(crate) struct StartupResponse {
    /// This message provides secret-key data that the frontend must
    /// save if it wants to be able to issue cancel requests later.
    pub backend_key_data: backend::BackendKeyData,
    /// Run-time parameters the backend reported during startup.
    pub parameters: Vec<backend::ParameterStatus>,
}

/// Perform a startup message.
///
/// <https://www.postgresql.org/docs/17/protocol-flow.html#PROTOCOL-FLOW-START-UP>
pub(crate) async fn startup<IO: PgTransport>(config: &Config, mut io: IO) -> Result<StartupResponse> {
    // To begin a session, a frontend opens a connection to the server and sends a startup message.

    // (Optionally, the startup message can include additional settings for run-time parameters.)

    io.send_startup(frontend::Startup {
        user: &config.user,
        database: Some(&config.dbname),
        options: &config.startup_options(),
    });
    io.flush().await?;

    // The server then sends an appropriate authentication request message,
    // to which the frontend must reply with an appropriate authentication response message (such as a password).
    //
    // For all authentication methods except GSSAPI, SSPI and SASL, there is at most one request and one response.
    // In some methods, no response at all is needed from the frontend, and so no authentication request occurs.
    // For GSSAPI, SSPI and SASL, multiple exchanges of packets may be needed to complete the authentication.

    let mut scram = None;

    loop {
        use backend::Authentication::*;
        match io.recv().await? {
            // we gucci
            Ok => break,
            // The frontend must now send a PasswordMessage containing the password in clear-text form.
            CleartextPassword => {
                io.send(frontend::PasswordMessage { password: &config.pass });
                io.flush().await?;
            },
            MD5Password { salt } => {
                let password = md5_password(&config.user, &config.pass, salt);
                io.send(frontend::PasswordMessage { password: &password });
                io.flush().await?;
            },
            SASL { mechanisms } => {
                if !backend::Authentication::supports_mechanism(&mechanisms, SCRAM_SHA_256) {
                    return Err(ProtocolError::new(
                        "server offers no supported SASL mechanism",
                    ).into());
                }
                let exchange = scram.insert(Scram::new());
                io.send(frontend::SaslInitialResponse {
                    mechanism: SCRAM_SHA_256,
                    response: &exchange.client_first(),
                });
                io.flush().await?;
            },
            SASLContinue { data } => {
                let Some(exchange) = scram.as_mut() else {
                    return Err(ProtocolError::new("SASL challenge before SASL started").into());
                };
                let data = std::str::from_utf8(&data)?;
                let response = exchange.client_final(&config.pass, data)?;
                io.send(frontend::SaslResponse { data: &response });
                io.flush().await?;
            },
            SASLFinal { data } => {
                let Some(exchange) = scram.as_ref() else {
                    return Err(ProtocolError::new("SASL outcome before SASL started").into());
                };
                exchange.verify(std::str::from_utf8(&data)?)?;
            },
            auth => return Err(ProtocolError::new(format!(
                "authentication method {auth:?} is not supported",
            )).into()),
        }
    }

    // After having received AuthenticationOk, the frontend must wait for further messages from the server.
    // In this phase a backend process is being started, and the frontend is just an interested bystander.
    // It is still possible for the startup attempt to fail (ErrorResponse) or the server to decline support
    // for the requested minor protocol version (NegotiateProtocolVersion), but in the normal case the backend
    // will send some ParameterStatus messages, BackendKeyData, and finally ReadyForQuery.
    //
    // During this phase the backend will attempt to apply any additional run-time parameter settings that
    // were given in the startup message. If successful, these values become session defaults.
    // An error causes ErrorResponse and exit.

    let mut parameters = vec![];
    let mut key_data = None;

    loop {
        use BackendMessage::*;
        match io.recv().await? {
            ReadyForQuery(_) => break,
            BackendKeyData(new_key_data) => key_data = Some(new_key_data),
            ParameterStatus(param) => parameters.push(param),
            f => Err(f.unexpected("startup phase"))?,
        }
    }

    Ok(StartupResponse {
        parameters,
        backend_key_data: key_data.expect("postgres never send backend key data"),
    })
}

//! Handler registration: binds the [`Station`] operations into a node's
//! dispatch registry.

use std::sync::Arc;

use gridlink_core::{handler_fn, HandlerFault, Node, Payload};

use crate::station::Station;
use crate::types::*;

/// Parse the inbound payload, run one station operation, and serialize the
/// typed response back into a payload.
macro_rules! station_op {
    ($station:expr, $req:ty, $method:ident) => {{
        let station = $station.clone();
        handler_fn(move |_ctx, payload: Payload| {
            let station = station.clone();
            async move {
                let request: $req = payload.parse()?;
                Payload::json(station.$method(&request)).map_err(HandlerFault::from)
            }
        })
    }};
}

/// Register the full station action set on `node`
pub fn register_station_handlers(node: &Node, station: Arc<Station>) {
    let dispatch = node.dispatch();

    dispatch.register("Reset", station_op!(station, ResetRequest, reset));
    dispatch.register(
        "SetDisplayMessage",
        station_op!(station, SetDisplayMessageRequest, set_display_message),
    );
    dispatch.register(
        "GetDisplayMessages",
        station_op!(station, GetDisplayMessagesRequest, get_display_messages),
    );
    dispatch.register(
        "ClearDisplayMessage",
        station_op!(station, ClearDisplayMessageRequest, clear_display_message),
    );
    dispatch.register(
        "InstallCertificate",
        station_op!(station, InstallCertificateRequest, install_certificate),
    );
    dispatch.register(
        "GetInstalledCertificateIds",
        station_op!(
            station,
            GetInstalledCertificateIdsRequest,
            installed_certificate_ids
        ),
    );
    dispatch.register(
        "DeleteCertificate",
        station_op!(station, DeleteCertificateRequest, delete_certificate),
    );

    {
        let station = station.clone();
        dispatch.register(
            "Heartbeat",
            handler_fn(move |_ctx, _payload| {
                let station = station.clone();
                async move { Payload::json(station.heartbeat()).map_err(HandlerFault::from) }
            }),
        );
    }
    dispatch.register(
        "BootNotification",
        station_op!(station, BootNotificationRequest, boot_notification),
    );
}

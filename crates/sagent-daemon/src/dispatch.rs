//! Request dispatch: one frame in, one response payload out.
//!
//! The dispatcher is the seam between the protocol layer and the
//! lifecycle controller. Every path through it produces exactly one
//! response; lifecycle failures never escape as errors, they are mapped
//! to their wire tags here.

use crate::lifecycle::Agent;
use crate::protocol::messages::{
    START_ERROR, STOP_ERROR, build_object_response, build_parse_error_response,
    build_tag_response, initiate_error_value, instance_value, list_value, parse_request,
};
use crate::protocol::{Request, RequestKind};

/// Handles one request payload and returns the response payload.
pub async fn handle_frame(agent: &mut Agent, payload: &[u8]) -> Vec<u8> {
    let request = match parse_request(payload) {
        Ok(request) => request,
        Err(err) => return build_parse_error_response(&err),
    };

    match request {
        Request::List => {
            let instances = match agent.list_instances() {
                Ok(instances) => instances,
                Err(err) => {
                    return build_tag_response(RequestKind::List.error_type(), err.tag());
                }
            };
            let leases = agent.list_leases();
            build_object_response(
                RequestKind::List.result_type(),
                list_value(&instances, &leases),
            )
        }

        Request::Create(create) => {
            let info = match agent.create_instance(&create).await {
                Ok(info) => info,
                Err(err) => {
                    return build_tag_response(RequestKind::Create.error_type(), err.tag());
                }
            };
            // Initiation is folded into create: the overlay from the
            // request configures and starts the instance. When that part
            // fails the instance itself survives in `created`, so the
            // error names the container for a follow-up destroy.
            if let Err(err) = agent
                .initiate_instance(&create.container_name, &create.config)
                .await
            {
                return build_object_response(
                    "initiate_error",
                    initiate_error_value(&info.container_name, err.tag()),
                );
            }
            // The reply carries the admission-time record: status
            // `created`, as allocated.
            build_object_response(RequestKind::Create.result_type(), instance_value(&info))
        }

        Request::Destroy { container_name } => {
            match agent.destroy_instance(&container_name).await {
                Ok(()) => build_tag_response(RequestKind::Destroy.result_type(), "destroyed"),
                Err(err) => build_tag_response(RequestKind::Destroy.error_type(), err.tag()),
            }
        }

        Request::Start { container_name } => {
            match agent.start_instance(&container_name).await {
                Ok(()) => build_tag_response(RequestKind::Start.result_type(), "started"),
                Err(_) => build_tag_response(RequestKind::Start.error_type(), START_ERROR),
            }
        }

        Request::Stop { container_name } => match agent.stop_instance(&container_name).await {
            Ok(()) => build_tag_response(RequestKind::Stop.result_type(), "stopped"),
            Err(_) => build_tag_response(RequestKind::Stop.error_type(), STOP_ERROR),
        },

        Request::Inspect { container_name } => {
            match agent.inspect_instance(&container_name).await {
                Ok(info) => build_object_response(
                    RequestKind::Inspect.result_type(),
                    instance_value(&info),
                ),
                Err(err) => build_tag_response(RequestKind::Inspect.error_type(), err.tag()),
            }
        }
    }
}

pub use natrix_proto as proto;

mod atomic;
mod auth;
mod client;
mod connector;
mod handler;
mod multiplexed_subscription;
mod nuid;
mod pool;
mod status;
mod subscription;
#[cfg(test)]
pub(crate) mod tests;

pub mod core {
    //! NATS Core functionality implementation

    pub use crate::auth::{AuthenticationMethod, Authenticator};
    pub use crate::client::{Client, ClientBuilder, Echo, QuickInfo, SubscribeOptions};
    pub(crate) use crate::multiplexed_subscription::MultiplexedSubscription;
    pub use crate::status::{Status, StatusStream};
    pub use crate::subscription::Subscription;

    pub mod publish {
        //! Utilities for publishing messages

        pub use crate::client::{
            ClientPublish, DoClientPublish, DoOwnedClientPublish, OwnedClientPublish, Publish,
            PublishBuilder,
        };
    }

    pub mod request {
        //! Utilities for publishing messages and awaiting for a response

        pub use crate::client::{
            ClientRequest, DoClientRequest, DoOwnedClientRequest, OwnedClientRequest, Request,
            RequestBuilder, ResponseFut,
        };
    }

    pub mod error {
        //! NATS Core specific errors

        pub use crate::auth::AuthenticationError;
        pub use crate::client::{
            ClientClosedError, ClientError, PublishError, ResponseError, SubscribeError,
            TryCommandError,
        };
        pub use crate::connector::ConnectError;
        pub use crate::subscription::SubscriptionError;
    }
}

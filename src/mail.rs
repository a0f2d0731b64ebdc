use std::{fs, io, num::NonZeroU32};

use governor::{
    Quota, RateLimiter,
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
};
use lazy_static::lazy_static;
use lettre::{
    Address, Message, SmtpTransport, Transport,
    message::{DkimConfig, DkimSigningAlgorithm, DkimSigningKey, Mailbox, header::ContentType},
    transport::smtp::authentication::Credentials,
};
use rusty_pool::ThreadPool;
use tera::Tera;

use crate::model::User;

lazy_static! {
    pub static ref MAIL_WORKER_POOL: ThreadPool = rusty_pool::Builder::new()
        .name(String::from("mail_worker_pool"))
        .core_size(2)
        .max_size(8)
        .build();
    pub static ref DKIM_KEY_PATH: Option<String> = std::env::var("DKIM_KEY_PATH").ok();
    pub static ref DKIM_SELECTOR: Option<String> = std::env::var("DKIM_SELECTOR").ok();
    pub static ref DKIM_DOMAIN: Option<String> = std::env::var("DKIM_DOMAIN").ok();
    pub static ref MAIL_SENDER_NAME: String =
        std::env::var("MAIL_SENDER_NAME").unwrap_or_else(|_| String::from("tecon-forum"));
    pub static ref MAIL_SENDER_ADDRESS: Option<Address> = std::env::var("MAIL_SENDER_ADDRESS")
        .map(|address| address.parse().expect("MAIL_SENDER_ADDRESS is invalid"))
        .ok();
    pub static ref ADMIN_MAIL_ADDRESS: Option<Address> = std::env::var("ADMIN_MAIL_ADDRESS")
        .map(|address| address.parse().expect("ADMIN_MAIL_ADDRESS is invalid"))
        .ok();
    pub static ref SMTP_HOST: Option<String> = std::env::var("SMTP_HOST").ok();
    pub static ref SMTP_USER: Option<String> = std::env::var("SMTP_USER").ok();
    pub static ref SMTP_PASSWORD: Option<String> = std::env::var("SMTP_PASSWORD").ok();
    pub static ref DKIM_KEY: Option<Result<String, io::Error>> =
        (*DKIM_KEY_PATH).as_ref().map(fs::read_to_string);
    pub static ref TEMPLATES: Tera = {
        match Tera::new("templates/*.html") {
            Ok(tera) => tera,
            Err(e) => panic!("Could not load tera templates: '{}'", e),
        }
    };
    pub static ref MAILS_PER_HOUR_LIMIT: u32 = std::env::var("MAILS_PER_HOUR_LIMIT")
        .map(|limit| limit.parse().expect("MAILS_PER_HOUR_LIMIT invalid"))
        .unwrap_or(120);
    pub static ref RATE_LIMITER: RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware> =
        RateLimiter::direct(Quota::per_hour(
            NonZeroU32::new(*MAILS_PER_HOUR_LIMIT).expect("MAILS_PER_HOUR_LIMIT invalid")
        ));
}

pub fn mail_enabled() -> bool {
    !(MAIL_SENDER_ADDRESS.is_none()
        || SMTP_HOST.is_none()
        || SMTP_USER.is_none()
        || SMTP_PASSWORD.is_none())
}

/// Informs the configured administrator address that a new account registered and awaits
/// confirmation.
pub fn send_registration_notice(created_user: &User) {
    let Some(ref admin_address) = *ADMIN_MAIL_ADDRESS else {
        log::warn!("Not sending registration notice because ADMIN_MAIL_ADDRESS is not set");
        return;
    };

    let mut context = tera::Context::new();
    context.insert("user_name", &created_user.user_name);
    context.insert("base_url", crate::API_BASE_URL.as_str());
    if let Some(ref company) = created_user.company {
        context.insert("company", company);
    }
    send_mail_to_address(
        "registration_notice.html",
        context,
        String::from("New account registration"),
        admin_address.clone(),
    );
}

/// Informs a user that their account has been confirmed by an administrator.
pub fn send_account_confirmed_mail(confirmed_user: User) {
    let context = tera::Context::new();
    send_mail(
        "account_confirmed.html",
        context,
        String::from("Account confirmed"),
        confirmed_user,
    );
}

/// Sends a moderator-created account its generated initial password.
pub fn send_account_created_mail(created_user: User, initial_password: String) {
    let mut context = tera::Context::new();
    context.insert("initial_password", &initial_password);
    send_mail(
        "account_created.html",
        context,
        String::from("Account created"),
        created_user,
    );
}

pub fn send_mail(
    template: &'static str,
    mut context: tera::Context,
    subject: String,
    recipient: User,
) {
    let email_address = if let Some(ref email) = recipient.email {
        email.clone()
    } else {
        log::error!("No email address for recipient: {}", &recipient.user_name);
        return;
    };

    let recipient_address: Address = match email_address.parse() {
        Ok(recipient_address) => recipient_address,
        Err(e) => {
            log::error!(
                "Invalid mail address {} for recipient {}: {e}",
                email_address,
                &recipient.user_name
            );
            return;
        }
    };

    context.insert("recipient", &recipient);
    send_mail_to_address(template, context, subject, recipient_address);
}

fn send_mail_to_address(
    template: &'static str,
    context: tera::Context,
    subject: String,
    recipient_address: Address,
) {
    if !mail_enabled() {
        log::error!("Cannot send mail due to incomplete configuration");
        return;
    }

    MAIL_WORKER_POOL.execute(move || {
        let body = match TEMPLATES.render(template, &context) {
            Ok(body) => body,
            Err(e) => {
                log::error!("Failed to render template {template}: {e}");
                return;
            }
        };

        let mut message = Message::builder()
            .from(Mailbox {
                name: Some(MAIL_SENDER_NAME.clone()),
                email: MAIL_SENDER_ADDRESS.clone().unwrap(),
            })
            .to(Mailbox {
                name: None,
                email: recipient_address.clone(),
            })
            .subject(subject)
            .header(ContentType::TEXT_HTML)
            .body(body)
            .unwrap();

        match *DKIM_KEY {
            Some(Ok(ref dkim_key)) => {
                let signing_key = DkimSigningKey::new(dkim_key, DkimSigningAlgorithm::Rsa);
                if DKIM_SELECTOR.is_some() && DKIM_DOMAIN.is_some() {
                    match signing_key {
                        Ok(key) => message.sign(&DkimConfig::default_config(
                            DKIM_SELECTOR.clone().unwrap(),
                            DKIM_DOMAIN.clone().unwrap(),
                            key,
                        )),
                        Err(e) => log::error!("Failed to sign DKIM: {e}"),
                    }
                } else {
                    log::error!("DKIM config is incomplete");
                }
            }
            Some(Err(ref e)) => log::error!("Failed to read DKIM file: {e}"),
            None => {}
        }

        let creds = Credentials::new(SMTP_USER.clone().unwrap(), SMTP_PASSWORD.clone().unwrap());

        let mailer = SmtpTransport::relay(SMTP_HOST.as_ref().unwrap())
            .unwrap()
            .credentials(creds)
            .build();

        futures::executor::block_on(RATE_LIMITER.until_ready());
        if let Err(e) = mailer.send(&message) {
            log::error!("Failed sending mail of template {template} to '{recipient_address}': {e}");
        } else {
            log::info!("Mail of template {template} sent to '{recipient_address}'");
        }
    });
}

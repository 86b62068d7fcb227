#![forbid(unsafe_code)]

// Configuration for mediasoup workers, routers, and transports

use crate::config::MediaSettings;
use mediasoup::prelude::*;
use mediasoup::worker::{WorkerDtlsFiles, WorkerLogLevel, WorkerLogTag};
use std::num::{NonZeroU32, NonZeroU8};

const AUDIO_CLOCK_RATE: NonZeroU32 = NonZeroU32::new(48_000).unwrap();
const VIDEO_CLOCK_RATE: NonZeroU32 = NonZeroU32::new(90_000).unwrap();
const STEREO: NonZeroU8 = NonZeroU8::new(2).unwrap();

/// Number of workers to spawn; zero in the settings means one per CPU
pub fn worker_count(settings: &MediaSettings) -> usize {
    if settings.num_workers == 0 {
        num_cpus::get()
    } else {
        settings.num_workers
    }
}

/// Converts media settings to mediasoup WorkerSettings
pub fn worker_settings(settings: &MediaSettings) -> WorkerSettings {
    let mut worker_settings = WorkerSettings::default();

    worker_settings.log_level = WorkerLogLevel::Warn;
    worker_settings.log_tags = vec![
        WorkerLogTag::Info,
        WorkerLogTag::Ice,
        WorkerLogTag::Dtls,
        WorkerLogTag::Rtp,
        WorkerLogTag::Rtcp,
    ];

    if let (Some(cert), Some(key)) = (&settings.dtls_certificate_file, &settings.dtls_private_key_file) {
        worker_settings.dtls_files = Some(WorkerDtlsFiles {
            certificate: cert.clone(),
            private_key: key.clone(),
        });
    }

    worker_settings
}

/// Listen address for every WebRTC transport
pub fn listen_info(settings: &MediaSettings) -> ListenInfo {
    ListenInfo {
        protocol: Protocol::Udp,
        ip: settings.listen_ip,
        announced_address: settings.announced_ip.clone(),
        port: None,
        port_range: Some(settings.rtc_min_port..=settings.rtc_max_port),
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    }
}

/// Codec capabilities offered by every room router
pub fn media_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = || {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    };

    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: AUDIO_CLOCK_RATE,
            channels: STEREO,
            parameters: RtpCodecParametersParameters::from([
                ("minptime", 10_u32.into()),
                ("useinbandfec", 1_u32.into()),
            ]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        // Hardware encoders on capture bridges usually only speak baseline H264
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}
